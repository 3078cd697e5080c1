// Profile data carried inside STFS containers: the encrypted account record
// and the XDBF databases (GPDs) holding achievements, titles and settings

pub mod account;
pub mod xdbf;

pub use account::{decrypt_account, decrypt_account_with, AccountInfo, AccountKey, Membership};
pub use xdbf::{Achievement, Namespace, Setting, SettingValue, Title, Xdbf, XdbfEntry};
