pub mod feed;
pub mod listener;
pub mod translate;
