pub mod bootcontrol;
pub mod message;
