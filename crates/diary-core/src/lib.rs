#![doc = include_str!("../README.md")]

pub mod credentials;
mod error;
mod ids;
mod login;
pub mod probe;
pub mod session;
mod settings;
pub mod tokens;

pub use error::{AuthError, AuthenticationError, MissingFieldError, NetworkError};
pub use ids::UserId;
pub use login::{AuthResult, Dependent, LoginSession, PendingLogin, RetryObserver};
pub use settings::ClientSettings;
