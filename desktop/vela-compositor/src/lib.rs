//! Vela Compositor - Wayland compositor core for the Vela desktop
//! environment.
//!
//! This crate implements the compositor's core engines: the surface and
//! shell protocol state machines, the input pipeline, atomic output
//! configuration, window mechanics and the cooperative event spine that
//! drives them all on a single thread. Rendering, the wire transport and
//! the service-bus clients are external collaborators behind the traits in
//! `renderer`, `protocol` and `services`.

pub mod buffer;
pub mod config;
pub mod geometry;
pub mod input;
pub mod interactive;
pub mod keyboard;
pub mod mechanics;
pub mod output;
pub mod output_config;
pub mod pointer;
pub mod positioner;
pub mod protocol;
pub mod renderer;
pub mod services;
pub mod shell;
pub mod spine;
pub mod state;
pub mod surface;
pub mod touch;

pub use config::CompositorConfig;
pub use renderer::Renderer;
pub use spine::EventSpine;
pub use state::DesktopState;

/// Version of the compositor
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the compositor
pub const NAME: &str = "vela-compositor";
