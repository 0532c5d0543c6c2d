#![forbid(unsafe_code)]

pub mod aimbot;
pub mod ashe;
pub mod baboon;
pub mod config;
pub mod context;
pub mod czar;
pub mod error;
pub mod ingress;
pub mod resolver;
pub mod router;
pub mod run;
pub mod stream;
pub mod sync;

pub use aimbot::{Aimbot, Dialer, Direct, Network};
pub use config::{load_from_path, Config, FileConfig, Overrides, Protocol, Role, RoutingMode};
pub use context::Ctx;
pub use error::{DazeError, Result};
pub use ingress::Locale;
pub use router::{Road, Router};
pub use stream::{BoxedIo, IoStream};
