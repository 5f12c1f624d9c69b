//! Core of the lxsm desktop session supervisor.
//!
//! A [`Session`] starts the window manager and the autostart modules of a
//! desktop session in phase order, restarts modules that crash (within the
//! limits of flood control) and tears everything down on logout.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration
//! - [`descriptor`]: module descriptors and their resolver
//! - [`environment`]: environment template shared by every child
//! - [`process`]: spawning, exit classification, program lookup
//! - [`registry`]: running-module bookkeeping
//! - [`crash`]: crash history and flood control
//! - [`readiness`]: window manager and tray readiness signals
//! - [`probe`]: command-based readiness probing
//! - [`sequencer`]: startup phases
//! - [`logout`]: graceful-then-forced teardown
//! - [`theme`]: theme directory watching
//! - [`events`]: session event bus
//! - [`session`]: the control loop tying it all together
//!
//! # Example
//!
//! ```rust,no_run
//! use lxsm_core::config::SessionConfig;
//! use lxsm_core::Session;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::from_toml(
//!     r#"
//!     [session]
//!     window_manager = "openbox"
//!
//!     [[autostart]]
//!     name = "panel"
//!     exec = ["lxqt-panel"]
//!     "#,
//! )?;
//! let session = Session::new(config);
//! let handle = session.handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     handle.logout();
//! });
//! let outcome = session.run().await?;
//! println!("session ended: {}", outcome.reason);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crash;
pub mod descriptor;
pub mod environment;
pub mod error;
pub mod events;
pub mod logout;
pub mod probe;
pub mod process;
pub mod readiness;
pub mod registry;
pub mod sequencer;
pub mod session;
pub mod theme;

pub use config::SessionConfig;
pub use descriptor::{DescriptorResolver, ModuleDescriptor};
pub use error::SessionError;
pub use events::{EventBus, SessionEvent, UserAlert};
pub use readiness::{PlatformEvent, ReadinessProbe};
pub use sequencer::SessionPhase;
pub use session::{
    LogoutReason, Session, SessionHandle, SessionOutcome, WindowManagerSelector,
};
