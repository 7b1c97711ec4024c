use std::fmt::{Display, Formatter};

/// The payload of a well-formed error reply that was correlated to a request. The substrate
///  does not interpret conditions beyond carrying them to the caller that awaited the reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StanzaError {
    pub condition: String,
    pub text: Option<String>,
}

impl Display for StanzaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{}: {}", self.condition, text),
            None => write!(f, "{}", self.condition),
        }
    }
}

/// One discrete protocol-level unit moving through the connection. The substrate treats
///  stanzas as opaque - parsing and serialization happen outside - except that it must be
///  able to recognize an error reply so collectors can surface it instead of returning it
///  as a regular result.
pub trait Stanza: Clone + Send + 'static {
    fn error_payload(&self) -> Option<StanzaError>;
}

/// Predicate over incoming stanzas, used by collectors to decide which stanzas they are
///  interested in.
pub trait StanzaFilter<M>: Send + Sync {
    fn accept(&self, stanza: &M) -> bool;
}

impl<M, F> StanzaFilter<M> for F
where
    F: Fn(&M) -> bool + Send + Sync,
{
    fn accept(&self, stanza: &M) -> bool {
        self(stanza)
    }
}
