//! Outstanding ticket handles between checkpoint cycles.

use deli_common::Result;
use futures::future::try_join_all;
use std::collections::HashMap;

use crate::ticket::TicketHandle;

/// Newest ticket handle per document since the last cycle.
///
/// Publications of one document are chained, so the newest handle resolving
/// covers every older one and older handles can be dropped on replacement.
#[derive(Debug, Default)]
pub struct PendingTickets {
    handles: HashMap<String, TicketHandle>,
}

impl PendingTickets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, handle: TicketHandle) {
        self.handles.insert(handle.document_id().to_string(), handle);
    }

    /// Move every tracked handle into a window, leaving the set empty.
    pub fn take(&mut self) -> TicketWindow {
        TicketWindow {
            handles: std::mem::take(&mut self.handles).into_values().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// The handles captured by one checkpoint cycle.
#[derive(Debug)]
pub struct TicketWindow {
    handles: Vec<TicketHandle>,
}

impl TicketWindow {
    /// Documents with outstanding work in this window.
    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.handles.iter().map(|handle| handle.document_id())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every handle; fails with the first publish error observed.
    pub async fn join(self) -> Result<()> {
        try_join_all(self.handles.into_iter().map(TicketHandle::wait)).await?;
        Ok(())
    }
}
