//! Record store key scheme.
//!
//! | Key | Type | Holds |
//! |-----|------|-------|
//! | `{ns}:job:{id}` | string | serialized `CompilationJob` |
//! | `{ns}:result:{id}` | string | serialized `JobState` |
//! | `{ns}:pdf:{id}` | string | artifact bytes |
//! | `{ns}:compilation:queue` | list | pending job ids, FIFO |
//! | `{ns}:compilation:processing` | set | ids claimed by a worker |
//! | `{ns}:ratelimit:{resource}` | sorted set | accepted request timestamps |

use texforge_core::JobId;

/// Default namespace shared by producer and worker.
pub const DEFAULT_NAMESPACE: &str = "latex";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: String,
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn job(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.namespace, id)
    }

    pub fn status(&self, id: &JobId) -> String {
        format!("{}:result:{}", self.namespace, id)
    }

    pub fn artifact(&self, id: &JobId) -> String {
        format!("{}:pdf:{}", self.namespace, id)
    }

    pub fn queue(&self) -> String {
        format!("{}:compilation:queue", self.namespace)
    }

    pub fn processing(&self) -> String {
        format!("{}:compilation:processing", self.namespace)
    }

    pub fn rate_limit(&self, resource: &str) -> String {
        format!("{}:ratelimit:{}", self.namespace, resource)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = KeySpace::new("test");
        let id = JobId::new();
        assert_eq!(keys.job(&id), format!("test:job:{id}"));
        assert_eq!(keys.status(&id), format!("test:result:{id}"));
        assert_eq!(keys.artifact(&id), format!("test:pdf:{id}"));
        assert_eq!(keys.queue(), "test:compilation:queue");
        assert_eq!(keys.processing(), "test:compilation:processing");
        assert_eq!(keys.rate_limit("doc-1"), "test:ratelimit:doc-1");
    }
}
