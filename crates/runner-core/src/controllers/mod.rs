pub mod cpu;
pub mod display;
pub mod media;
pub mod ram;

pub use cpu::CpuController;
pub use display::DisplayController;
pub use media::MediaController;
pub use ram::RamController;
