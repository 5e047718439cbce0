//! Shared test doubles and fixtures for the trading intel pipeline.

mod bus;
mod clock;
mod fixtures;
mod store;

pub use bus::{RecordingBus, SlowBus, SteppingBus};
pub use clock::{FixedClock, ManualClock};
pub use fixtures::{make_candidate, make_event};
pub use store::InMemoryEventStore;
