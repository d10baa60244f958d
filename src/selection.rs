//! Single-file selection over the cached tree.
//!
//! Selecting a node always replaces the previous selection; selecting the
//! selected node again deselects it. Whether the selection is acceptable is
//! only decided on [`SelectionManager::confirm`]: it must name exactly one
//! file node whose payload passes the [`FormatFilter`].

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SelectionError;
use crate::node::{FilePayload, NodeAddress};
use crate::tree_cache::TreeCache;

/// Accepted format tokens. An empty filter accepts every file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatFilter {
    tokens: Vec<String>,
}

impl FormatFilter {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        FormatFilter {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// A payload passes when any token is a substring of its file name, equals its
    /// extension, or is a substring of its mimetype. Comparisons ignore case.
    pub fn accepts(&self, payload: &FilePayload) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        let name = payload.name.to_lowercase();
        let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_string());
        let mimetype = payload.mimetype.as_deref().map(str::to_lowercase);

        self.tokens.iter().any(|token| {
            let bare = token.trim_start_matches('.');
            name.contains(token.as_str())
                || extension.as_deref() == Some(bare)
                || mimetype.as_deref().is_some_and(|m| m.contains(bare))
        })
    }
}

pub struct SelectionManager {
    cache: Arc<TreeCache>,
    filter: FormatFilter,
    selected: Vec<NodeAddress>,
}

impl SelectionManager {
    pub fn new(cache: Arc<TreeCache>, filter: FormatFilter) -> Self {
        SelectionManager {
            cache,
            filter,
            selected: Vec::new(),
        }
    }

    pub fn filter(&self) -> &FormatFilter {
        &self.filter
    }

    pub fn selected(&self) -> &[NodeAddress] {
        &self.selected
    }

    pub fn toggle(&mut self, address: &NodeAddress) {
        if self.selected.contains(address) {
            self.selected.retain(|a| a != address);
            debug!(address = %address, "Deselected node");
        } else {
            self.selected = vec![address.clone()];
            debug!(address = %address, "Selected node");
        }
    }

    /// Returns the selected file's payload and clears the selection.
    /// On error the selection is kept so the user can correct it.
    pub fn confirm(&mut self) -> Result<FilePayload, SelectionError> {
        let address = match self.selected.as_slice() {
            [] => return Err(SelectionError::NoSelection),
            [only] => only.clone(),
            _ => {
                return Err(SelectionError::InvalidSelection(
                    "Only one file can be selected".to_string(),
                ))
            }
        };

        let node = self.cache.get(&address).ok_or_else(|| {
            warn!(address = %address, "Selected address is not in the tree cache");
            SelectionError::InvalidSelection(format!("'{address}' is no longer available"))
        })?;

        let payload = match node.payload() {
            Some(payload) => payload.clone(),
            None => {
                return Err(SelectionError::InvalidSelection(format!(
                    "'{}' is a folder; please select a file",
                    node.label
                )))
            }
        };

        if !self.filter.accepts(&payload) {
            return Err(SelectionError::InvalidSelection(format!(
                "'{}' does not match the accepted formats: {}",
                payload.name,
                self.filter.tokens().join(", ")
            )));
        }

        info!(address = %address, file = %payload.name, "Selection confirmed");
        self.selected.clear();
        Ok(payload)
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }
}
