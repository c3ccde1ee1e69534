pub mod handle;
pub mod model;
pub mod pool;

pub use handle::ModelHandle;
pub use model::{LinearPolicyEngine, LinearPolicyModel};
pub use pool::{PooledPredictor, Prediction, PredictorState};
