pub mod hooks;
pub mod in_app;
pub mod ingress;
pub mod pipeline;
pub mod push;
