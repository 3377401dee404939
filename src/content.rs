//! Model input content
//!
//! [`Content`] is one unit of input (text, image or audio); [`ContentCollection`] is an
//! ordered list of them that can optionally take ownership of its children.

use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::handle::NativeHandle;
use crate::native::{ContentPayload, NativeRuntime, RawHandle};

/// Kind of a [`Content`] item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    ImageBytes,
    ImagePath,
    AudioBytes,
    AudioPath,
}

/// One unit of model input, backed by exactly one native handle.
#[derive(Debug)]
pub struct Content {
    kind: ContentKind,
    text: Option<String>,
    bytes: Option<Vec<u8>>,
    handle: NativeHandle,
}

impl Content {
    fn create(
        runtime: &Arc<dyn NativeRuntime>,
        kind: ContentKind,
        text: Option<String>,
        bytes: Option<Vec<u8>>,
    ) -> Result<Self> {
        let payload = match (kind, &text, &bytes) {
            (ContentKind::Text, Some(t), _) => ContentPayload::Text(t),
            (ContentKind::ImagePath, Some(t), _) => ContentPayload::ImageFile(t),
            (ContentKind::AudioPath, Some(t), _) => ContentPayload::AudioFile(t),
            (ContentKind::ImageBytes, _, Some(b)) => ContentPayload::ImageBytes(b),
            (ContentKind::AudioBytes, _, Some(b)) => ContentPayload::AudioBytes(b),
            _ => {
                return Err(BridgeError::Allocation(format!(
                    "missing payload for {kind:?} content"
                )))
            }
        };

        let raw = runtime.create_content(payload).ok_or_else(|| {
            tracing::error!("Could not create {:?} content", kind);
            BridgeError::Allocation(format!("{kind:?} content"))
        })?;

        Ok(Self {
            kind,
            text,
            bytes,
            handle: NativeHandle::new(runtime.clone(), raw, "Content"),
        })
    }

    pub fn text(runtime: &Arc<dyn NativeRuntime>, text: impl Into<String>) -> Result<Self> {
        Self::create(runtime, ContentKind::Text, Some(text.into()), None)
    }

    pub fn image_bytes(runtime: &Arc<dyn NativeRuntime>, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::create(runtime, ContentKind::ImageBytes, None, Some(data.into()))
    }

    pub fn image_file(runtime: &Arc<dyn NativeRuntime>, path: impl Into<String>) -> Result<Self> {
        Self::create(runtime, ContentKind::ImagePath, Some(path.into()), None)
    }

    pub fn audio_bytes(runtime: &Arc<dyn NativeRuntime>, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::create(runtime, ContentKind::AudioBytes, None, Some(data.into()))
    }

    pub fn audio_file(runtime: &Arc<dyn NativeRuntime>, path: impl Into<String>) -> Result<Self> {
        Self::create(runtime, ContentKind::AudioPath, Some(path.into()), None)
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Text payload for `Text`, or the file path for `ImagePath` / `AudioPath`.
    pub fn text_payload(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn bytes_payload(&self) -> Option<&[u8]> {
        self.bytes.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.get()
    }

    /// Releases the native handle. Safe to call more than once.
    pub fn release(&self) {
        self.handle.release();
    }
}

/// Ordered collection of [`Content`] items backed by a native list.
///
/// When `owns_children` is set, releasing the collection also releases every item. The
/// flag is only read at release time.
#[derive(Debug)]
pub struct ContentCollection {
    contents: Vec<Arc<Content>>,
    owns_children: bool,
    handle: NativeHandle,
}

impl ContentCollection {
    pub fn new<I>(runtime: &Arc<dyn NativeRuntime>, contents: I, owns_children: bool) -> Result<Self>
    where
        I: IntoIterator<Item = Arc<Content>>,
    {
        let contents: Vec<Arc<Content>> = contents.into_iter().collect();

        // Resolve every child before allocating so a released child costs no native call
        let raws = contents
            .iter()
            .map(|content| content.raw())
            .collect::<Result<Vec<_>>>()?;

        let list = runtime.create_content_list().ok_or_else(|| {
            tracing::error!("Could not create native content list");
            BridgeError::Allocation("content list".to_string())
        })?;
        let handle = NativeHandle::new(runtime.clone(), list, "ContentCollection");

        for (index, raw) in raws.into_iter().enumerate() {
            if !runtime.append_content(list, raw) {
                // `handle` drops here and frees the list; children stay with the caller
                return Err(BridgeError::Allocation(format!(
                    "append of content {index} to {list}"
                )));
            }
        }

        Ok(Self {
            contents,
            owns_children,
            handle,
        })
    }

    /// Builds a collection that owns freshly created items.
    pub fn owned(runtime: &Arc<dyn NativeRuntime>, contents: Vec<Content>) -> Result<Self> {
        Self::new(runtime, contents.into_iter().map(Arc::new), true)
    }

    pub fn contents(&self) -> &[Arc<Content>] {
        &self.contents
    }

    pub fn owns_children(&self) -> bool {
        self.owns_children
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_released()
    }

    pub(crate) fn raw(&self) -> Result<RawHandle> {
        self.handle.get()
    }

    /// Releases the list handle, then the children if the collection owns them.
    pub fn release(&self) {
        if !self.handle.release() {
            return;
        }
        if self.owns_children {
            for content in &self.contents {
                content.release();
            }
        }
    }
}

impl Drop for ContentCollection {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::MockRuntime;
    use crate::native::HandleKind;

    fn runtime() -> (Arc<MockRuntime>, Arc<dyn NativeRuntime>) {
        let mock = MockRuntime::new();
        let runtime: Arc<dyn NativeRuntime> = mock.clone();
        (mock, runtime)
    }

    #[test]
    fn test_content_factories() {
        let (_mock, runtime) = runtime();

        let text = Content::text(&runtime, "hello").unwrap();
        assert_eq!(text.kind(), ContentKind::Text);
        assert_eq!(text.text_payload(), Some("hello"));
        assert!(text.bytes_payload().is_none());

        let image = Content::image_bytes(&runtime, vec![1u8, 2, 3]).unwrap();
        assert_eq!(image.kind(), ContentKind::ImageBytes);
        assert_eq!(image.bytes_payload(), Some(&[1u8, 2, 3][..]));

        let audio = Content::audio_file(&runtime, "/tmp/clip.wav").unwrap();
        assert_eq!(audio.kind(), ContentKind::AudioPath);
        assert_eq!(audio.text_payload(), Some("/tmp/clip.wav"));
    }

    #[test]
    fn test_content_allocation_failure() {
        let (mock, runtime) = runtime();
        mock.fail_allocations_of(Some(HandleKind::Content));

        let result = Content::image_file(&runtime, "/tmp/cat.png");
        assert!(matches!(result, Err(BridgeError::Allocation(_))));
        assert_eq!(mock.total_releases(), 0);
    }

    #[test]
    fn test_content_double_release() {
        let (mock, runtime) = runtime();
        let content = Content::text(&runtime, "once").unwrap();
        let raw = content.raw().unwrap();

        content.release();
        let calls = mock.native_calls();
        content.release();
        drop(content);

        assert_eq!(mock.release_count(raw), 1);
        assert_eq!(mock.native_calls(), calls);
    }

    #[test]
    fn test_collection_preserves_order() {
        let (mock, runtime) = runtime();
        let a = Arc::new(Content::text(&runtime, "a").unwrap());
        let b = Arc::new(Content::audio_bytes(&runtime, vec![0u8; 4]).unwrap());
        let expected = vec![a.raw().unwrap(), b.raw().unwrap()];

        let collection = ContentCollection::new(&runtime, vec![a, b], false).unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(mock.list_members(collection.raw().unwrap()), expected);
    }

    #[test]
    fn test_owning_collection_releases_children_once() {
        let (mock, runtime) = runtime();
        let collection = ContentCollection::owned(
            &runtime,
            vec![
                Content::text(&runtime, "a").unwrap(),
                Content::text(&runtime, "b").unwrap(),
            ],
        )
        .unwrap();
        let children: Vec<_> = collection
            .contents()
            .iter()
            .map(|c| c.raw().unwrap())
            .collect();
        let list = collection.raw().unwrap();

        collection.release();
        collection.release();
        drop(collection);

        assert_eq!(mock.release_count(list), 1);
        for child in children {
            assert_eq!(mock.release_count(child), 1);
        }
    }

    #[test]
    fn test_borrowing_collection_leaves_children_usable() {
        let (mock, runtime) = runtime();
        let child = Arc::new(Content::text(&runtime, "shared").unwrap());
        let collection = ContentCollection::new(&runtime, vec![child.clone()], false).unwrap();

        collection.release();

        assert!(!child.is_released());
        assert_eq!(mock.release_count(child.raw().unwrap()), 0);

        // Still usable in a second collection
        let again = ContentCollection::new(&runtime, vec![child.clone()], false).unwrap();
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_collection_rejects_released_child() {
        let (mock, runtime) = runtime();
        let child = Arc::new(Content::text(&runtime, "gone").unwrap());
        child.release();
        let calls = mock.native_calls();

        let result = ContentCollection::new(&runtime, vec![child], true);
        assert_eq!(result.unwrap_err(), BridgeError::Disposed("Content"));
        assert_eq!(mock.native_calls(), calls);
    }

    #[test]
    fn test_failed_append_frees_list() {
        let (mock, runtime) = runtime();
        let child = Arc::new(Content::text(&runtime, "x").unwrap());
        mock.fail_appends(true);

        let result = ContentCollection::new(&runtime, vec![child.clone()], true);
        assert!(matches!(result, Err(BridgeError::Allocation(_))));

        // List released, child untouched
        assert_eq!(mock.total_releases(), 1);
        assert!(!child.is_released());
    }
}
