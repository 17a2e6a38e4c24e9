//! Assertion harness for language server tests.
//!
//! [`Harness`] records what a server sends and offers bounded expectations
//! over it. Fixtures describe recorded interactions that a [`Replayer`]
//! drives against a live server. [`Interaction`] wraps common requests with
//! assertion helpers, and [`MockServer`] stands in for a server in tests.

mod error;
mod fixture;
mod harness;
mod interaction;
mod matching;
mod mock;
mod replay;

pub use error::HarnessError;
pub use fixture::{Fixture, ResponseExpectation, Step, load_fixture, load_fixture_in, parse_fixture};
pub use harness::{ExpectMode, Harness, MAX_WAIT};
pub use interaction::{
    CompletionAssertion, DefinitionAssertion, DocumentSymbolsAssertion, HoverAssertion,
    Interaction, ReferencesAssertion, Span,
};
pub use matching::{Mismatch, json_contains, json_matches};
pub use mock::{DEFAULT_RECV_WAIT, MockServer, mock_pair};
pub use replay::{ReplayReport, Replayer, StepOutcome, StepReport};
