//! Helpers shared between the test suites of several modules.

use crate::stanza::{Stanza, StanzaError};

/// Minimal stanza type for tests: an id for correlation and an optional error payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestStanza {
    pub id: u32,
    pub error: Option<StanzaError>,
}

impl TestStanza {
    pub fn new(id: u32) -> TestStanza {
        TestStanza { id, error: None }
    }

    pub fn with_error(id: u32, condition: &str) -> TestStanza {
        TestStanza {
            id,
            error: Some(StanzaError {
                condition: condition.to_string(),
                text: None,
            }),
        }
    }
}

impl Stanza for TestStanza {
    fn error_payload(&self) -> Option<StanzaError> {
        self.error.clone()
    }
}

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
