mod image;
mod request;

pub use image::*;
pub use request::*;
