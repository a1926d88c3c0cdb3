pub const CHANNELS: usize = 3;
pub const HEIGHT: usize = 32;
pub const WIDTH: usize = 32;

/// Spatial size of the first generator feature map and the last critic one.
pub const BOTTOM: usize = 4;
