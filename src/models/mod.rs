pub mod driver;
pub mod passenger;
pub mod request;
pub mod ride;
