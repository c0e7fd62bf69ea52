use std::sync::{PoisonError, RwLock};

/// Ambient application state read at enrichment time. The pipeline never
/// writes through this trait; the embedding application owns the values.
///
/// `session_id` returning `None` means no session exists yet and events are
/// held in the pre-session buffer until one appears.
pub trait StateSource: Send + Sync {
    fn session_id(&self) -> Option<String>;
    fn user_id(&self) -> Option<String>;
    fn page_url(&self) -> Option<String>;
    fn device(&self) -> Option<String>;
}

#[derive(Default)]
struct StateValues {
    session_id: Option<String>,
    user_id: Option<String>,
    page_url: Option<String>,
    device: Option<String>,
}

/// Interior-mutable [`StateSource`] for applications that update identity
/// and page context as the user moves around.
#[derive(Default)]
pub struct SharedState {
    values: RwLock<StateValues>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.write().session_id = Some(session_id.into());
    }

    pub fn clear_session(&self) {
        self.write().session_id = None;
    }

    pub fn set_user_id(&self, user_id: impl Into<String>) {
        self.write().user_id = Some(user_id.into());
    }

    pub fn clear_user(&self) {
        self.write().user_id = None;
    }

    pub fn set_page_url(&self, page_url: impl Into<String>) {
        self.write().page_url = Some(page_url.into());
    }

    pub fn set_device(&self, device: impl Into<String>) {
        self.write().device = Some(device.into());
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StateValues> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StateValues> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StateSource for SharedState {
    fn session_id(&self) -> Option<String> {
        self.read().session_id.clone()
    }

    fn user_id(&self) -> Option<String> {
        self.read().user_id.clone()
    }

    fn page_url(&self) -> Option<String> {
        self.read().page_url.clone()
    }

    fn device(&self) -> Option<String> {
        self.read().device.clone()
    }
}
