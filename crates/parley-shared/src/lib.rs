//! # parley-shared
//!
//! Domain vocabulary shared by the store and server crates: user roles,
//! role-flag sets for broadcast addressing, directory profiles with the
//! display-name resolution precedence, and real-time subscription keys.

pub mod roles;
pub mod subject;
pub mod profile;

pub use profile::UserProfile;
pub use roles::{Role, RoleSet};
pub use subject::{SubjectKey, SubjectKeyError};
