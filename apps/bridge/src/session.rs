//! Conversation routing and persisted slot bindings.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::config::SessionBindingMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversationSource {
    Body,
    Binding,
    Unspecified,
}

/// Resolved routing for one request.
#[derive(Clone, Debug)]
pub struct Routing {
    pub slot: String,
    pub conversation_id: Option<String>,
    pub source: ConversationSource,
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("conversation_id is required when session binding mode is explicit")]
    MissingConversationId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BindingsFile {
    bindings: HashMap<String, String>,
}

/// Slot → conversation bindings, atomically persisted as JSON.
///
/// Reads come from memory and never block writers; writes serialize on a
/// chain and land via a same-directory temp file + rename.
pub struct SessionStore {
    path: PathBuf,
    map: RwLock<HashMap<String, String>>,
    write_chain: Mutex<()>,
}

impl SessionStore {
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let map = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<BindingsFile>(&bytes)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
                    .bindings
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            map: RwLock::new(map),
            write_chain: Mutex::new(()),
        })
    }

    pub async fn get(&self, slot: &str) -> Option<String> {
        self.map.read().await.get(slot).cloned()
    }

    pub async fn list(&self) -> HashMap<String, String> {
        self.map.read().await.clone()
    }

    pub async fn set(&self, slot: &str, conversation_id: &str) -> io::Result<()> {
        {
            let mut map = self.map.write().await;
            map.insert(slot.to_string(), conversation_id.to_string());
        }
        self.persist().await
    }

    /// Purges a binding; returns whether one existed.
    pub async fn delete(&self, slot: &str) -> io::Result<bool> {
        let existed = self.map.write().await.remove(slot).is_some();
        if existed {
            self.persist().await?;
        }
        Ok(existed)
    }

    async fn persist(&self) -> io::Result<()> {
        let _chain = self.write_chain.lock().await;
        let snapshot = BindingsFile {
            bindings: self.map.read().await.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let tmp = temp_sibling(&self.path);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bindings".to_string());
    name.push_str(".tmp");
    path.with_file_name(name)
}

/// Resolves slot and conversation per the configured binding mode.
pub struct SessionRouter {
    mode: SessionBindingMode,
    default_slot: String,
    store: SessionStore,
}

impl SessionRouter {
    #[must_use]
    pub fn new(mode: SessionBindingMode, default_slot: String, store: SessionStore) -> Self {
        Self {
            mode,
            default_slot,
            store,
        }
    }

    #[must_use]
    pub fn mode(&self) -> SessionBindingMode {
        self.mode
    }

    #[must_use]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    #[must_use]
    pub fn normalize_slot(&self, session_key: Option<&str>) -> String {
        let slot = session_key.map(str::trim).unwrap_or_default().to_lowercase();
        if slot.is_empty() {
            self.default_slot.clone()
        } else {
            slot
        }
    }

    pub async fn resolve(
        &self,
        session_key: Option<&str>,
        conversation_id: Option<&str>,
    ) -> Result<Routing, RoutingError> {
        let conversation_id = conversation_id
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        match self.mode {
            SessionBindingMode::Off => Ok(Routing {
                slot: String::new(),
                conversation_id: None,
                source: ConversationSource::Unspecified,
            }),
            SessionBindingMode::Explicit => {
                let conversation_id =
                    conversation_id.ok_or(RoutingError::MissingConversationId)?;
                Ok(Routing {
                    slot: self.normalize_slot(session_key),
                    conversation_id: Some(conversation_id),
                    source: ConversationSource::Body,
                })
            }
            SessionBindingMode::Sticky => {
                let slot = self.normalize_slot(session_key);
                if let Some(conversation_id) = conversation_id {
                    return Ok(Routing {
                        slot,
                        conversation_id: Some(conversation_id),
                        source: ConversationSource::Body,
                    });
                }
                match self.store.get(&slot).await {
                    Some(bound) => Ok(Routing {
                        slot,
                        conversation_id: Some(bound),
                        source: ConversationSource::Binding,
                    }),
                    None => Ok(Routing {
                        slot,
                        conversation_id: None,
                        source: ConversationSource::Unspecified,
                    }),
                }
            }
        }
    }

    /// Persists a binding after a successful ask, when the driver reports the
    /// conversation it opened and the routing qualifies: sticky with a
    /// body-sourced id, or explicit.
    pub async fn persist_binding(
        &self,
        routing: &Routing,
        opened_conversation_id: Option<&str>,
    ) -> io::Result<()> {
        let Some(opened) = opened_conversation_id else {
            return Ok(());
        };
        let qualifies = match self.mode {
            SessionBindingMode::Sticky => routing.source == ConversationSource::Body,
            SessionBindingMode::Explicit => true,
            SessionBindingMode::Off => false,
        };
        if qualifies {
            self.store.set(&routing.slot, opened).await?;
        }
        Ok(())
    }
}
