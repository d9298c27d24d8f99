//! Node and execution identity generation.
//!
//! Identities are 12 lowercase hex characters (6 random bytes).  Collisions
//! are astronomically unlikely but the insert paths still retry on a
//! uniqueness violation rather than trusting the first draw.

pub const ID_LEN: usize = 12;

pub fn generate() -> String {
    hex::encode(rand::random::<[u8; 6]>())
}
