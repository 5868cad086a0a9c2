//! Display and input runtime for boot-time environments
//!
//! [`ui`] drives the display (DRM or fbdev) and draws into it; [`input`]
//! multiplexes kernel input devices into callbacks. Both are
//! single-threaded and block only where the caller asks them to.

pub mod config;
pub mod input;
pub mod kmsg;
pub mod res;
pub mod ui;

pub use config::Config;
pub use input::EventMultiplexer;
pub use ui::Graphics;
