pub mod edit;
pub mod promote;
pub mod rollover;
pub mod sign;
