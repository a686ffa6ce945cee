pub mod ws;

pub use ws::ws_handler;
