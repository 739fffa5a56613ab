pub mod attempts;
pub mod interceptor;
pub mod message;
pub mod regeneration;
pub mod session;
pub mod tracker;

pub use attempts::{AttemptNavigator, AttemptStore};
pub use interceptor::{Capture, CapturePath, MessageInterceptor, MessageListEvent};
pub use message::{Message, MessageId, Role};
pub use regeneration::{
    AttemptSink, RegenerationCoordinator, RegenerationError, RegenerationResult,
    RegenerationState, StartPolicy, merge_attempt,
};
pub use session::ChatSession;
pub use tracker::{
    ClientStreamTracker, HttpInterruptNotifier, InterruptAck, InterruptNotifier, NotifyError,
    NotifyResult, TeardownGuard, TeardownReport, TrackerSettings,
};
