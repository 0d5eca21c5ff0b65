//! Cross-process IPC core of a Bluetooth host stack: fixed-size envelopes on a byte stream,
//!  client sessions with synchronous command round trips and asynchronous events, and the
//!  service side that dispatches commands and pushes events to subscribed clients.

pub mod client;
pub mod config;
pub mod message;
pub mod registry;
pub mod server;
pub mod status;
pub mod test_util;
pub mod transport;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
