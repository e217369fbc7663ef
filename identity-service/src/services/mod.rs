pub mod challenge;
pub mod database;
pub mod error;
pub mod mfa;
pub mod risk;
pub mod saml;
pub mod session;
pub mod token;
pub mod webauthn;

pub use challenge::{ChallengeStore, MemoryChallengeStore, RedisChallengeStore};
pub use database::Database;
pub use error::ServiceError;
pub use mfa::{MfaMethod, MfaService, SeedCipher};
pub use risk::RiskEngine;
pub use saml::{SamlService, SlsBinding};
pub use session::SessionService;
pub use token::{AccessTokenClaims, IssuedTokens, TokenService};
pub use webauthn::WebauthnService;
