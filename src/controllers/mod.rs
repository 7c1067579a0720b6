pub mod order_controller;
pub mod home_controller;
