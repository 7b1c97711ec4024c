pub mod collector;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod link;
pub mod reactor;
pub mod reconnect;
pub mod stanza;
pub mod test_util;
pub mod util;
