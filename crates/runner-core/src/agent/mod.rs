pub mod connector;
pub mod guest;
pub mod vmop;

pub use connector::AgentConnector;
pub use guest::GuestAgentClient;
pub use vmop::VmopAgentClient;
