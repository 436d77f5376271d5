// ABOUTME: Cryptography module root for per-user API key encryption
// ABOUTME: Exposes the AES-GCM cipher with PBKDF2 user-scoped key derivation
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives for API key storage

pub mod keys;

pub use keys::{ApiKeyCipher, EncryptedData, EncryptedKeyMap};
