pub mod connection;
pub mod poller;

pub use connection::handle_connection;
pub use poller::{DEFAULT_POLL_INTERVAL, NotificationPoller};
