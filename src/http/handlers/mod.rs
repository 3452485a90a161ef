pub mod admin;
pub mod install;
pub mod oidc;
pub mod opaque;
pub mod otp;
pub mod session;
