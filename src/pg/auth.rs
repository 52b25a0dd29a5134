//! Password hashing for MD5 authentication and `ALTER ROLE ... PASSWORD`.

/// Compute the MD5 password response: `md5` + md5(md5(password + user) + salt).
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner_hex = format!("{:x}", md5::compute(format!("{}{}", password, user)));

    let mut outer = inner_hex.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

/// Pre-hash a password the way the server stores MD5 passwords.
///
/// The result can be sent in `ALTER ROLE ... PASSWORD '...'` without the
/// clear-text password ever leaving the client.
pub fn encrypt_password(password: &str, user: &str) -> String {
    format!("md5{:x}", md5::compute(format!("{}{}", password, user)))
}
