mod websocket;

pub use websocket::{Connection, connect_url};
