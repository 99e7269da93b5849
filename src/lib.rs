pub mod echo;
pub mod port;

pub use echo::{run_echo_loop, EchoError, EchoSettings, EchoStats, PATTERN};
pub use port::{Port, PortError, MAX_PATH_LEN, SUPPORTED_SPEEDS};
