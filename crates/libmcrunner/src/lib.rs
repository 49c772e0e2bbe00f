pub mod auth;
pub mod error;
pub mod output;
pub mod registry;
pub mod relay;
pub mod session;
pub mod stdin;

pub use error::ConsoleError;
pub use output::{LineRing, OutputLine};
pub use registry::ConsoleRegistry;
pub use relay::{MAX_LINE_LEN, OutputRelay, relay_lines};
pub use session::RemoteSession;
pub use stdin::StdinMux;
