pub mod client;
pub mod refresh;
pub mod sources;

pub use client::DecisionClient;
pub use refresh::{NoOpPollObserver, PollObserver, PollTarget};
pub use sources::{
    FileModelSource, HttpModelSource, HttpSettingsSource, ModelFetch, ModelSource, SettingsSource,
};
