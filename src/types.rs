use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// Milliseconds since the Unix epoch, the unit of every local timestamp.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Kind of generation a task or history record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationType {
    Create,
    WhiteBackground,
    ClothingChange,
    ProductScene,
    LightShadow,
}

impl GenerationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationType::Create => "create",
            GenerationType::WhiteBackground => "white_background",
            GenerationType::ClothingChange => "clothing_change",
            GenerationType::ProductScene => "product_scene",
            GenerationType::LightShadow => "light_shadow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(GenerationType::Create),
            "white_background" => Some(GenerationType::WhiteBackground),
            "clothing_change" => Some(GenerationType::ClothingChange),
            "product_scene" => Some(GenerationType::ProductScene),
            "light_shadow" => Some(GenerationType::LightShadow),
            _ => None,
        }
    }

    /// Human-readable name used in notifications.
    pub fn display_name(&self) -> &'static str {
        match self {
            GenerationType::Create => "Image",
            GenerationType::WhiteBackground => "White background",
            GenerationType::ClothingChange => "Outfit change",
            GenerationType::ProductScene => "Product scene",
            GenerationType::LightShadow => "Light and shadow",
        }
    }
}

/// Backend task status. Anything the client does not recognise is `Unknown`
/// and treated as still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// A backend-tracked async generation unit (`GET /tasks/{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationTask {
    #[serde(default)]
    pub id: u64,
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub prompt: String,
    /// JSON-encoded array of reference image URLs.
    #[serde(default)]
    pub ref_images: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default = "default_image_count")]
    pub image_count: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_image_count() -> u32 {
    1
}

impl GenerationTask {
    pub fn generation_type(&self) -> Option<GenerationType> {
        GenerationType::parse(&self.task_type)
    }

    pub fn ref_image_list(&self) -> Vec<String> {
        parse_ref_images(&self.ref_images)
    }

    /// Local stand-in for a task the client stopped tracking before the
    /// backend reported a terminal status.
    pub fn abandoned(
        task_id: impl Into<String>,
        generation_type: GenerationType,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            task_type: generation_type.as_str().to_string(),
            prompt: String::new(),
            ref_images: String::new(),
            image_url: String::new(),
            error_msg: message.into(),
            image_count: 1,
            created_at: None,
            started_at: None,
            updated_at: Some(Utc::now()),
        }
    }

    /// Creation time in epoch millis, or `fallback` if the backend sent none.
    pub fn timestamp_or(&self, fallback: i64) -> i64 {
        self.created_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(fallback)
    }
}

/// A server-persisted history record (`GET /history`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationHistory {
    #[serde(default)]
    pub id: u64,
    pub prompt: String,
    #[serde(default)]
    pub original_prompt: String,
    pub image_url: String,
    #[serde(default)]
    pub file_name: String,
    /// JSON-encoded array of reference image URLs.
    #[serde(default)]
    pub ref_images: Option<String>,
    #[serde(rename = "type", default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub aspect_ratio: String,
    #[serde(default)]
    pub image_size: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub batch_index: Option<u32>,
    #[serde(default)]
    pub batch_total: Option<u32>,
}

impl GenerationHistory {
    /// Batch id when this record belongs to a multi-image group.
    pub fn multi_batch_id(&self) -> Option<&str> {
        match (&self.batch_id, self.batch_total) {
            (Some(id), Some(total)) if total > 1 && !id.is_empty() => Some(id.as_str()),
            _ => None,
        }
    }

    /// Whether this record is shown on a view of `generation_type`.
    /// Untyped records predate typing and belong to `create`.
    pub fn matches_type(&self, generation_type: GenerationType) -> bool {
        match self.record_type.as_deref() {
            None | Some("") => generation_type == GenerationType::Create,
            Some(t) => t == generation_type.as_str(),
        }
    }

    pub fn ref_image_list(&self) -> Vec<String> {
        self.ref_images
            .as_deref()
            .map(parse_ref_images)
            .unwrap_or_default()
    }
}

/// Parse a JSON-encoded URL array, tolerating empty or malformed input.
pub fn parse_ref_images(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// Lifecycle of a locally tracked generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One image position of a result grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ImageSlot {
    Loading,
    Ready { url: String },
    Failed { error: String },
}

impl ImageSlot {
    pub fn is_loading(&self) -> bool {
        matches!(self, ImageSlot::Loading)
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ImageSlot::Ready { url } => Some(url),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ImageSlot::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Unified lifecycle record for one submitted generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationItem {
    pub id: String,
    pub task_id: Option<String>,
    pub batch_id: Option<String>,
    pub status: GenerationStatus,
    pub prompt: String,
    pub image_count: u32,
    pub images: Vec<ImageSlot>,
    pub error_message: Option<String>,
    pub generation_type: GenerationType,
    pub ref_images: Vec<String>,
    pub timestamp: i64,
}

impl GenerationItem {
    /// New `pending` placeholder with a freshly generated local id.
    pub fn pending(prompt: impl Into<String>, image_count: u32, generation_type: GenerationType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: None,
            batch_id: None,
            status: GenerationStatus::Pending,
            prompt: prompt.into(),
            image_count: image_count.max(1),
            images: Vec::new(),
            error_message: None,
            generation_type,
            ref_images: Vec::new(),
            timestamp: now_millis(),
        }
    }

    /// Build an item mirroring a backend task, keyed by its task id.
    pub fn from_task(task: &GenerationTask) -> Self {
        let mut item = Self {
            id: format!("task-{}", task.task_id),
            task_id: Some(task.task_id.clone()),
            batch_id: None,
            status: GenerationStatus::Processing,
            prompt: task.prompt.clone(),
            image_count: task.image_count.max(1),
            images: Vec::new(),
            error_message: None,
            generation_type: task.generation_type().unwrap_or(GenerationType::Create),
            ref_images: task.ref_image_list(),
            timestamp: task.timestamp_or(now_millis()),
        };
        match task.status {
            TaskStatus::Completed => item.complete(vec![ImageSlot::Ready {
                url: task.image_url.clone(),
            }]),
            TaskStatus::Failed => item.fail(task.error_msg.clone()),
            _ => {}
        }
        item
    }

    /// Attach the backend task id; the item is now `processing`.
    pub fn mark_processing(&mut self, task_id: impl Into<String>) {
        self.task_id = Some(task_id.into());
        self.status = GenerationStatus::Processing;
    }

    pub fn complete(&mut self, images: Vec<ImageSlot>) {
        self.images = images;
        self.error_message = None;
        self.status = GenerationStatus::Completed;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.images.clear();
        self.error_message = Some(message.into());
        self.status = GenerationStatus::Failed;
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status,
            GenerationStatus::Completed | GenerationStatus::Failed
        )
    }
}

/// Status of a multi-image session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Streaming,
    Completed,
    Failed,
}

/// A multi-image result grid. `images.len() == image_count` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub images: Vec<ImageSlot>,
    pub prompt: String,
    pub timestamp: i64,
    pub image_count: usize,
    pub ref_images: Vec<String>,
    pub status: BatchStatus,
}

impl BatchResult {
    /// A batch whose every slot is still loading.
    pub fn streaming(
        batch_id: impl Into<String>,
        prompt: impl Into<String>,
        image_count: usize,
        ref_images: Vec<String>,
    ) -> Self {
        let count = image_count.max(1);
        Self {
            batch_id: batch_id.into(),
            images: vec![ImageSlot::Loading; count],
            prompt: prompt.into(),
            timestamp: now_millis(),
            image_count: count,
            ref_images,
            status: BatchStatus::Streaming,
        }
    }

    /// A finished batch from authoritative per-slot results.
    pub fn completed(
        batch_id: impl Into<String>,
        prompt: impl Into<String>,
        images: Vec<ImageSlot>,
        ref_images: Vec<String>,
    ) -> Self {
        let mut images = images;
        if images.is_empty() {
            images.push(ImageSlot::Failed {
                error: crate::sanitize::GENERIC_FAILURE_MESSAGE.to_string(),
            });
        }
        Self {
            batch_id: batch_id.into(),
            image_count: images.len(),
            images,
            prompt: prompt.into(),
            timestamp: now_millis(),
            ref_images,
            status: BatchStatus::Completed,
        }
    }

    /// A batch where every one of `image_count` slots failed with `error`.
    pub fn failed(
        batch_id: impl Into<String>,
        prompt: impl Into<String>,
        image_count: usize,
        error: impl Into<String>,
    ) -> Self {
        let count = image_count.max(1);
        let error = error.into();
        Self {
            batch_id: batch_id.into(),
            images: vec![ImageSlot::Failed { error }; count],
            prompt: prompt.into(),
            timestamp: now_millis(),
            image_count: count,
            ref_images: Vec::new(),
            status: BatchStatus::Failed,
        }
    }

    /// Fill one slot in place. Out-of-range indices are ignored and reported
    /// as `false`.
    pub fn set_slot(&mut self, index: usize, slot: ImageSlot) -> bool {
        match self.images.get_mut(index) {
            Some(existing) => {
                *existing = slot;
                true
            }
            None => false,
        }
    }

    /// Turn every still-loading slot into a failure carrying `error`.
    pub fn fail_remaining(&mut self, error: &str) {
        for slot in self.images.iter_mut().filter(|s| s.is_loading()) {
            *slot = ImageSlot::Failed {
                error: error.to_string(),
            };
        }
    }

    pub fn loading_count(&self) -> usize {
        self.images.iter().filter(|s| s.is_loading()).count()
    }

    pub fn has_success(&self) -> bool {
        self.images.iter().any(|s| s.url().is_some())
    }

    pub fn all_failed(&self) -> bool {
        self.images.iter().all(|s| s.error().is_some())
    }
}

/// A current-session failure that was never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedGeneration {
    pub id: String,
    pub prompt: String,
    pub error_message: String,
    pub timestamp: i64,
}

/// Per-image result as it appears on the wire (sync multi and SSE complete).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireImage {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub index: Option<usize>,
}

impl WireImage {
    /// Convert to a display slot. The error, if any, is sanitized; the flag
    /// reports whether it was a quota error.
    pub fn to_slot(&self) -> (ImageSlot, bool) {
        match (&self.image_url, &self.error) {
            (_, Some(error)) if !error.is_empty() => {
                let sanitized = crate::sanitize::user_error(error);
                (
                    ImageSlot::Failed {
                        error: sanitized.message,
                    },
                    sanitized.is_quota_error,
                )
            }
            (Some(url), _) if !url.is_empty() => (ImageSlot::Ready { url: url.clone() }, false),
            _ => (
                ImageSlot::Failed {
                    error: crate::sanitize::GENERIC_FAILURE_MESSAGE.to_string(),
                },
                false,
            ),
        }
    }
}

/// Lay out wire images as slots, one per image, placed by `index` where it is
/// present and unclaimed, otherwise by position. Returns the slots and whether
/// any of them failed on quota.
pub fn slots_from_wire(images: &[WireImage]) -> (Vec<ImageSlot>, bool) {
    let mut quota_error = false;
    let mut slots = vec![ImageSlot::Loading; images.len()];
    for (position, img) in images.iter().enumerate() {
        let (slot, quota) = img.to_slot();
        quota_error |= quota;
        let target = img
            .index
            .filter(|i| *i < slots.len() && slots[*i].is_loading())
            .or_else(|| slots.iter().position(ImageSlot::is_loading))
            .unwrap_or(position);
        slots[target] = slot;
    }
    (slots, quota_error)
}

/// A reference image attached to a generation request.
#[derive(Debug, Clone)]
pub struct RefImage {
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

/// Form fields of `POST /generate`.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub image_size: String,
    pub count: u32,
    pub generation_type: GenerationType,
    pub images: Vec<RefImage>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: "1:1".to_string(),
            image_size: "2K".to_string(),
            count: 1,
            generation_type: GenerationType::Create,
            images: Vec::new(),
        }
    }

    pub fn aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.aspect_ratio = ratio.into();
        self
    }

    pub fn image_size(mut self, size: impl Into<String>) -> Self {
        self.image_size = size.into();
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count.max(1);
        self
    }

    pub fn generation_type(mut self, generation_type: GenerationType) -> Self {
        self.generation_type = generation_type;
        self
    }

    pub fn reference_image(mut self, image: RefImage) -> Self {
        self.images.push(image);
        self
    }
}

/// The three shapes `POST /generate` can answer with.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerateResponse {
    /// Async: the backend accepted the job and will be polled.
    Task { task_id: String },
    /// Sync, one image.
    Single {
        image_url: String,
        ref_images: Vec<String>,
    },
    /// Sync, several images sharing a batch id.
    Multi {
        batch_id: String,
        images: Vec<WireImage>,
        ref_images: Vec<String>,
    },
}

impl GenerateResponse {
    /// Classify a `/generate` JSON body. A body with none of `task_id`,
    /// `image_url`, or `images` is an invalid response.
    pub fn from_json(json: &Value) -> Result<Self> {
        let ref_images: Vec<String> = json
            .get("ref_images")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        if let Some(task_id) = non_empty_str(json, "task_id") {
            return Ok(GenerateResponse::Task {
                task_id: task_id.to_string(),
            });
        }

        if let Some(images) = json.get("images").and_then(|v| v.as_array()) {
            let batch_id = non_empty_str(json, "batch_id")
                .map(String::from)
                .unwrap_or_else(|| format!("sync-{}", uuid::Uuid::new_v4()));
            let images = images
                .iter()
                .map(|img| match img {
                    Value::String(url) => WireImage {
                        image_url: Some(url.clone()),
                        ..WireImage::default()
                    },
                    other => serde_json::from_value(other.clone()).unwrap_or_default(),
                })
                .collect();
            return Ok(GenerateResponse::Multi {
                batch_id,
                images,
                ref_images,
            });
        }

        if let Some(url) = non_empty_str(json, "image_url") {
            return Ok(GenerateResponse::Single {
                image_url: url.to_string(),
                ref_images,
            });
        }

        Err(SyncError::InvalidResponse(
            "Response missing task_id, image_url, or images".into(),
        ))
    }
}

fn non_empty_str<'a>(json: &'a Value, key: &str) -> Option<&'a str> {
    json.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_unknown() {
        let status: TaskStatus = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(status, TaskStatus::Unknown);
        assert!(!status.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_parse_task() {
        let task: GenerationTask = serde_json::from_str(
            r#"{
            "id": 7,
            "task_id": "t-1",
            "status": "processing",
            "type": "create",
            "prompt": "cat",
            "ref_images": "[\"http://x/ref.png\"]",
            "image_url": "",
            "error_msg": "",
            "image_count": 2,
            "created_at": "2026-01-02T03:04:05Z"
        }"#,
        )
        .unwrap();
        assert_eq!(task.generation_type(), Some(GenerationType::Create));
        assert_eq!(task.ref_image_list(), vec!["http://x/ref.png".to_string()]);
        assert_eq!(task.image_count, 2);
        assert!(task.created_at.is_some());
    }

    #[test]
    fn test_history_type_filter() {
        let record: GenerationHistory = serde_json::from_str(
            r#"{"prompt": "p", "image_url": "u", "created_at": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(record.matches_type(GenerationType::Create));
        assert!(!record.matches_type(GenerationType::LightShadow));
        assert!(record.multi_batch_id().is_none());
    }

    #[test]
    fn test_batch_slots_fixed_length() {
        let mut batch = BatchResult::streaming("b1", "dog", 3, Vec::new());
        assert_eq!(batch.images.len(), 3);
        assert!(batch.set_slot(1, ImageSlot::Ready { url: "u1".into() }));
        assert!(!batch.set_slot(5, ImageSlot::Ready { url: "u5".into() }));
        assert_eq!(batch.images.len(), 3);
        assert_eq!(batch.loading_count(), 2);

        batch.fail_remaining("connection lost");
        assert_eq!(batch.images[1].url(), Some("u1"));
        assert_eq!(batch.images[0].error(), Some("connection lost"));
        assert!(batch.has_success());
        assert!(!batch.all_failed());
    }

    #[test]
    fn test_streaming_count_clamped() {
        let batch = BatchResult::streaming("b", "p", 0, Vec::new());
        assert_eq!(batch.image_count, 1);
        assert_eq!(batch.images.len(), 1);
    }

    #[test]
    fn test_generation_item_lifecycle() {
        let mut item = GenerationItem::pending("cat", 1, GenerationType::Create);
        assert_eq!(item.status, GenerationStatus::Pending);
        item.mark_processing("t-9");
        assert_eq!(item.status, GenerationStatus::Processing);
        assert!(!item.is_resolved());
        item.fail("boom");
        assert!(item.is_resolved());
        assert!(item.images.is_empty());
        item.complete(vec![ImageSlot::Ready { url: "u".into() }]);
        assert!(item.error_message.is_none());
    }

    #[test]
    fn test_generate_response_shapes() {
        let t = GenerateResponse::from_json(&serde_json::json!({"task_id": "abc"})).unwrap();
        assert_eq!(t, GenerateResponse::Task { task_id: "abc".into() });

        let s = GenerateResponse::from_json(&serde_json::json!({
            "status": "success", "image_url": "http://x/cat.png"
        }))
        .unwrap();
        assert!(matches!(s, GenerateResponse::Single { ref image_url, .. } if image_url == "http://x/cat.png"));

        let m = GenerateResponse::from_json(&serde_json::json!({
            "batch_id": "b7",
            "images": [{"image_url": "u0", "index": 0}, {"error": "nsfw", "index": 1}]
        }))
        .unwrap();
        match m {
            GenerateResponse::Multi { batch_id, images, .. } => {
                assert_eq!(batch_id, "b7");
                assert_eq!(images.len(), 2);
                assert_eq!(images[1].error.as_deref(), Some("nsfw"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(GenerateResponse::from_json(&serde_json::json!({"status": "ok"})).is_err());
    }

    #[test]
    fn test_item_from_task_keyed_by_task_id() {
        let running: GenerationTask = serde_json::from_value(serde_json::json!({
            "task_id": "abc",
            "status": "processing",
            "type": "product_scene",
            "prompt": "vase"
        }))
        .unwrap();
        let item = GenerationItem::from_task(&running);
        assert_eq!(item.id, "task-abc");
        assert_eq!(item.task_id.as_deref(), Some("abc"));
        assert_eq!(item.status, GenerationStatus::Processing);
        assert_eq!(item.generation_type, GenerationType::ProductScene);

        let mut other = running.clone();
        other.task_id = "def".into();
        assert_ne!(GenerationItem::from_task(&other).id, item.id);

        let mut done = running;
        done.status = TaskStatus::Completed;
        done.image_url = "http://x/v.png".into();
        let item = GenerationItem::from_task(&done);
        assert!(item.is_resolved());
        assert_eq!(item.images[0].url(), Some("http://x/v.png"));
    }
}
