pub mod channels;
pub mod fragmentation;
pub mod models;
pub mod settings;
pub mod tunnel_frame;
