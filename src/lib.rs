//! An OpenFlow 1.0 controller that load-balances client flows over a pool of
//! backend servers.

mod bits;
pub mod config;
pub mod error;
pub mod flow_key;
pub mod flow_table;
pub mod load_balancer;
pub mod ofp_controller;
pub mod ofp_header;
pub mod ofp_message;
pub mod openflow0x01;
pub mod packet;
pub mod policy;
pub mod runtime;
pub mod server_pool;
pub mod switch;

pub use config::LbConfig;
pub use error::{LbError, OfpError};
pub use flow_key::FlowKey;
pub use load_balancer::{Handled, LbStats, LoadBalancer};
pub use server_pool::ServerId;
