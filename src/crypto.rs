// dtctl - CLI for the Darktrace API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Password protection for the stored private key.
//!
//! The stored form is `base64(salt).base64(iv).base64(ciphertext)`.

use aes::Aes128;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine, engine::general_purpose::STANDARD};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const SALT_LEN: usize = 8;
const IV_LEN: usize = 16;
const KEY_LEN: usize = 16;
const ROUNDS: u32 = 1000;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("stored key is not in salt.iv.ciphertext form")]
    Malformed,
    #[error("stored key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Password incorrect")]
    PasswordIncorrect,
}

fn derive_key(pass_phrase: &str, salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha1>(pass_phrase.as_bytes(), salt, ROUNDS, &mut key);
    key
}

pub fn encrypt(pass_phrase: &str, data: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let iv: [u8; IV_LEN] = rand::random();
    let key = derive_key(pass_phrase, &salt);
    let ciphertext =
        Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data.as_bytes());
    [
        STANDARD.encode(salt),
        STANDARD.encode(iv),
        STANDARD.encode(ciphertext),
    ]
    .join(".")
}

pub fn decrypt(pass_phrase: &str, stored: &str) -> Result<String, CryptoError> {
    let mut parts = stored.trim().split('.');
    let (Some(salt), Some(iv), Some(ciphertext), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CryptoError::Malformed);
    };
    let salt = STANDARD.decode(salt)?;
    let iv: [u8; IV_LEN] = STANDARD
        .decode(iv)?
        .try_into()
        .map_err(|_| CryptoError::Malformed)?;
    let ciphertext = STANDARD.decode(ciphertext)?;

    let key = derive_key(pass_phrase, &salt);
    let plain = Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::PasswordIncorrect)?;
    String::from_utf8(plain).map_err(|_| CryptoError::PasswordIncorrect)
}
