//! Admin-token gate for the admin/review surface.

use dispatch_core::error::{DispatchError, Result};

/// Guards `admin_*`, `submit_review`, and `broadcast_system_prompt`.
///
/// When no token is configured the gate is open (development mode); when
/// one is configured, requests must carry it or fail with PERMISSION.
#[derive(Debug, Clone, Default)]
pub struct AdminGate {
    token: Option<String>,
}

impl AdminGate {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn open() -> Self {
        Self { token: None }
    }

    pub fn is_enforcing(&self) -> bool {
        self.token.is_some()
    }

    pub fn authorize(&self, provided: Option<&str>) -> Result<()> {
        match &self.token {
            None => Ok(()),
            Some(expected) => match provided {
                Some(token) if token == expected => Ok(()),
                Some(_) => Err(DispatchError::Permission(
                    "invalid admin token".to_string(),
                )),
                None => Err(DispatchError::Permission(
                    "admin token required".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_gate_allows_everything() {
        let gate = AdminGate::open();
        assert!(!gate.is_enforcing());
        assert!(gate.authorize(None).is_ok());
        assert!(gate.authorize(Some("anything")).is_ok());
    }

    #[test]
    fn test_enforcing_gate() {
        let gate = AdminGate::new(Some("s3cret".to_string()));
        assert!(gate.is_enforcing());
        assert!(gate.authorize(Some("s3cret")).is_ok());

        let err = gate.authorize(Some("wrong")).unwrap_err();
        assert_eq!(err.kind(), dispatch_core::ErrorKind::Permission);
        assert!(gate.authorize(None).is_err());
    }

    #[test]
    fn test_blank_token_means_open() {
        let gate = AdminGate::new(Some("   ".to_string()));
        assert!(!gate.is_enforcing());
    }
}
