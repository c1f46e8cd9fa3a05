/// Domain objects and their locked/unlocked transitions.
pub mod activation;
pub mod group;
pub mod keychain;
pub mod secret;
pub mod session;
pub mod user;

pub use activation::ActivationToken;
pub use group::Group;
pub use keychain::KeychainItem;
pub use secret::{Secret, SecretMeta};
pub use session::{Session, SessionStore};
pub use user::{User, UserStatus};
