pub mod employee;
pub mod event;
pub mod outcome;
pub mod request;
