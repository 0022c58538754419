use chrono::{DateTime, Utc};
use std::{fmt, sync::Arc};

/// Source of "now" for every time-dependent read and rewrite.
///
/// Storage carries one of these instead of calling [`Utc::now`] directly so
/// tests can pin the time used for bucket math and payload rewrites.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>);

impl Clock {
    /// Wall clock.
    pub fn system() -> Self {
        Self(Arc::new(Utc::now))
    }

    /// Always returns `at`.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self(Arc::new(move || at))
    }

    pub fn from_fn(f: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}
