pub mod user;
pub mod order;
pub mod event;

pub use user::CurrentUser;
pub use order::{NewOrder, Order, OrderPatch, OrderStatus};
pub use event::{DecodeError, EventEnvelope, OrderEvent, OrderSnapshot};
