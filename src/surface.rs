//! Host-facing seams: the surface the indexer scans and the adapter the
//! stream extracts messages through.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::arena::{ElementArena, ElementHandle};
use crate::error::SurfaceError;
use crate::schema::{MessagePart, StructuredMessage};

/// One message element as the surface lists it.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceNode {
    pub handle: ElementHandle,
    pub message_id: Option<String>,
    pub role: Option<String>,
    pub channel: Option<String>,
}

/// Result of reading the message container, oldest element first.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerScan {
    pub container: ElementHandle,
    pub nodes: Vec<SurfaceNode>,
}

/// Attributes the indexer writes back onto an element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeTag {
    pub index: usize,
    pub ordinal: u64,
    pub role: Option<String>,
    pub channel: Option<String>,
}

pub trait MessageSurface: Send + Sync {
    fn scan(&self) -> Result<ContainerScan, SurfaceError>;

    fn tag(&self, element: ElementHandle, tag: &NodeTag) -> Result<(), SurfaceError>;
}

pub trait CaptureAdapter: Send + Sync {
    /// `None`, or a message without content, means "not rendered yet".
    fn collect_structured_message(&self, element: ElementHandle) -> Option<StructuredMessage>;

    fn session_url(&self) -> Option<String>;
}

#[derive(Debug)]
struct SurfaceElement {
    message: StructuredMessage,
    tag: Option<NodeTag>,
}

#[derive(Debug)]
struct SurfaceState {
    arena: ElementArena<SurfaceElement>,
    containers: ElementArena<()>,
    container: ElementHandle,
    order: Vec<ElementHandle>,
    session_url: Option<String>,
    tag_failures: HashMap<ElementHandle, String>,
    scan_failure: Option<String>,
}

/// In-process surface backed by an [`ElementArena`].
///
/// Serves as the host for the replay binary and as the fake page in tests:
/// messages can be pushed before their content "renders", the container can
/// be swapped to simulate navigation, and faults can be injected.
#[derive(Debug)]
pub struct MemorySurface {
    state: Mutex<SurfaceState>,
}

impl MemorySurface {
    pub fn new(session_url: Option<String>) -> Self {
        let mut containers = ElementArena::new();
        let container = containers.insert(());
        Self {
            state: Mutex::new(SurfaceState {
                arena: ElementArena::new(),
                containers,
                container,
                order: Vec::new(),
                session_url,
                tag_failures: HashMap::new(),
                scan_failure: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SurfaceState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message as the newest element.
    pub fn push(&self, message: StructuredMessage) -> ElementHandle {
        let mut state = self.state();
        let handle = state.arena.insert(SurfaceElement { message, tag: None });
        state.order.push(handle);
        handle
    }

    /// Fill in content for an element that was pushed unrendered.
    pub fn render(&self, element: ElementHandle, parts: Vec<MessagePart>) -> bool {
        match self.state().arena.get_mut(element) {
            Some(entry) => {
                entry.message.parts = parts;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, element: ElementHandle) -> Option<StructuredMessage> {
        let mut state = self.state();
        state.order.retain(|handle| *handle != element);
        state.arena.remove(element).map(|entry| entry.message)
    }

    /// Drop every element and mount a fresh container, like a page navigation.
    pub fn navigate(&self, session_url: Option<String>) {
        let mut state = self.state();
        let old = state.container;
        state.containers.remove(old);
        state.container = state.containers.insert(());
        state.arena.clear();
        state.order.clear();
        state.session_url = session_url;
    }

    pub fn set_session_url(&self, session_url: Option<String>) {
        self.state().session_url = session_url;
    }

    pub fn tag_of(&self, element: ElementHandle) -> Option<NodeTag> {
        self.state().arena.get(element).and_then(|entry| entry.tag.clone())
    }

    pub fn len(&self) -> usize {
        self.state().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_tagging(&self, element: ElementHandle, reason: impl Into<String>) {
        self.state().tag_failures.insert(element, reason.into());
    }

    pub fn fail_scans(&self, reason: Option<String>) {
        self.state().scan_failure = reason;
    }
}

impl MessageSurface for MemorySurface {
    fn scan(&self) -> Result<ContainerScan, SurfaceError> {
        let state = self.state();
        if let Some(reason) = &state.scan_failure {
            return Err(SurfaceError::Other(reason.clone()));
        }
        let nodes = state
            .order
            .iter()
            .filter_map(|handle| {
                state.arena.get(*handle).map(|entry| SurfaceNode {
                    handle: *handle,
                    message_id: entry.message.id.clone(),
                    role: entry.message.role.clone(),
                    channel: entry.message.channel.clone(),
                })
            })
            .collect();
        Ok(ContainerScan {
            container: state.container,
            nodes,
        })
    }

    fn tag(&self, element: ElementHandle, tag: &NodeTag) -> Result<(), SurfaceError> {
        let mut state = self.state();
        if let Some(reason) = state.tag_failures.get(&element) {
            return Err(SurfaceError::Other(reason.clone()));
        }
        let entry = state
            .arena
            .get_mut(element)
            .ok_or(SurfaceError::Detached(element))?;
        entry.tag = Some(tag.clone());
        Ok(())
    }
}

impl CaptureAdapter for MemorySurface {
    fn collect_structured_message(&self, element: ElementHandle) -> Option<StructuredMessage> {
        let state = self.state();
        let entry = state.arena.get(element)?;
        let mut message = entry.message.clone();
        if let Some(tag) = &entry.tag {
            message.index = Some(tag.index);
            message.ordinal = Some(tag.ordinal);
        }
        Some(message)
    }

    fn session_url(&self) -> Option<String> {
        self.state().session_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_replaces_container_and_elements() {
        let surface = MemorySurface::new(Some("a".into()));
        let first = surface.push(StructuredMessage::default());
        let before = surface.scan().unwrap();

        surface.navigate(Some("b".into()));
        surface.push(StructuredMessage::default());
        let after = surface.scan().unwrap();

        assert_ne!(before.container, after.container);
        assert_eq!(after.nodes.len(), 1);
        assert_ne!(after.nodes[0].handle, first);
        assert_eq!(surface.session_url().as_deref(), Some("b"));
        assert!(surface.collect_structured_message(first).is_none());
    }

    #[test]
    fn extraction_reflects_tags_and_rendering() {
        let surface = MemorySurface::new(None);
        let handle = surface.push(StructuredMessage {
            id: Some("m1".into()),
            ..Default::default()
        });
        assert!(!surface.collect_structured_message(handle).unwrap().has_content());

        surface
            .tag(
                handle,
                &NodeTag {
                    index: 0,
                    ordinal: 1,
                    role: None,
                    channel: None,
                },
            )
            .unwrap();
        surface.render(handle, vec![MessagePart::text("hello")]);

        let message = surface.collect_structured_message(handle).unwrap();
        assert!(message.has_content());
        assert_eq!(message.ordinal, Some(1));
    }
}
