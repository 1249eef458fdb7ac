pub mod assets;
pub mod port_file;
pub mod response;
