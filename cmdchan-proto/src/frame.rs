//! Version tag, HMAC-MD5 authentication, AES-256-CBC encryption, and raw
//! DEFLATE compression wrapped around a `cmdchan_wire::Table` body.
//!
//! `to_wire`/`from_wire` operate on an already-length-prefix-stripped byte
//! range; the connection layer reads the `u32` frame length off the socket
//! and enforces [`cmdchan_wire::MAX_WIRE_SIZE`] before calling [`from_wire`].

use cmdchan_wire::{decode_body, encode_body, Table, Value};

use crate::error::FrameError;

/// The protocol's version field. Despite "version byte" in informal
/// descriptions, the wire form is a 4-byte big-endian integer.
pub const VERSION: u32 = 1;

/// The fixed first 21 bytes of an encoded `{_auth: {hmd5: <blob>}}` table:
/// key-length/`_auth`, type/length header for a nested table, key-length/
/// `hmd5`, and the type/length header for a 22-byte blob. Any wire form
/// matching the protocol's grammar produces exactly this prefix (keylen
/// octets carry `actual_key_length - 1`); decoding checks it literally as a
/// cross-check against codec drift.
const AUTH_FIXED_PREFIX: [u8; 21] = [
    0x04, 0x5f, 0x61, 0x75, 0x74, 0x68, 0x02, 0x00, 0x00, 0x00, 0x20, 0x03, 0x68, 0x6d, 0x64, 0x35,
    0x01, 0x00, 0x00, 0x00, 0x16,
];

/// Encode `message` (a full `{_ctrl, _data, ...}` table) to its wire form:
/// `u32 total_length | u32 version | [_auth table] | body`.
///
/// `_auth` is dropped from the input if present (it is always recomputed);
/// `_ctrl._comp` is consumed as the compression hint and stripped before
/// encoding, since it is not itself part of the wire vocabulary once acted
/// on. If `_ctrl._enc` is present the body is AES-256-CBC encrypted (and,
/// if `_comp` was set, DEFLATE-compressed first); this requires `secret`.
pub fn to_wire(message: &Table, secret: Option<&[u8]>) -> Result<Vec<u8>, FrameError> {
    let mut message = message.clone();
    message.remove("_auth");

    let mut want_compress = false;
    if let Some(Value::Table(ctrl)) = message.get_mut("_ctrl") {
        if let Some(comp) = ctrl.remove("_comp") {
            want_compress = comp.as_str() == Some("1");
        }
    }

    let has_enc = message
        .get_table("_ctrl")
        .is_some_and(|ctrl| ctrl.contains_key("_enc"));

    let mut unsigned = encode_body(&message)?;

    if has_enc {
        let secret = secret.ok_or(FrameError::NeedSecret)?;

        let mut inner = Vec::with_capacity(4 + unsigned.len());
        inner.extend_from_slice(&(unsigned.len() as u32).to_be_bytes());
        inner.extend_from_slice(&unsigned);

        let (to_encrypt, field_name) = if want_compress {
            (cmdchan_crypto::deflate_raw(&inner), "_aes256z")
        } else {
            (inner, "_aes256")
        };

        let padded = cmdchan_crypto::pad_to_block(&to_encrypt);
        let key = cmdchan_crypto::derive_key(secret);
        let ciphertext = cmdchan_crypto::encrypt_cbc(&key, &padded)?;

        let mut outer = Table::new();
        outer.insert(field_name, Value::blob(ciphertext));
        unsigned = encode_body(&outer)?;
    }

    let mut res = Vec::with_capacity(4 + unsigned.len());
    res.extend_from_slice(&VERSION.to_be_bytes());

    if let Some(secret) = secret {
        let sig = cmdchan_crypto::sign_hmac_md5_base64(secret, &unsigned);
        let mut hmd5 = Table::new();
        hmd5.insert("hmd5", sig);
        let mut auth = Table::new();
        auth.insert("_auth", hmd5);
        res.extend_from_slice(&encode_body(&auth)?);
    }
    res.extend_from_slice(&unsigned);

    if res.len() > u32::MAX as usize {
        return Err(FrameError::TooBig);
    }
    let mut framed = Vec::with_capacity(4 + res.len());
    framed.extend_from_slice(&(res.len() as u32).to_be_bytes());
    framed.extend_from_slice(&res);
    Ok(framed)
}

/// Decode a frame (version tag, optional `_auth` envelope, body) from
/// `bytes`, which must already have had the outer `u32` length prefix
/// stripped. Verifies the signature if a secret is provided (or an
/// `_auth` block is present — the two must agree), decrypts/decompresses
/// if `_aes256`/`_aes256z` is present, and normalizes `_ctrl._enc` in the
/// result: present and `"1"` if the message arrived protected, absent
/// otherwise.
pub fn from_wire(bytes: &[u8], secret: Option<&[u8]>) -> Result<Table, FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::UnexpectedEnd);
    }
    let version = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
    if version != VERSION {
        return Err(FrameError::BadVersion(version));
    }
    let rest = &bytes[4..];
    let table = decode_body(rest)?;
    basic_syntax_checks(&table, true)?;
    let has_auth = table.contains_key("_auth");

    if secret.is_some() || has_auth {
        if secret.is_none() || !has_auth {
            return Err(FrameError::BadAuth("signature mismatch"));
        }
        let secret = secret.unwrap();
        if rest.len() < 43 {
            return Err(FrameError::UnexpectedEnd);
        }
        let auth_prefix = &rest[..21];
        let msig = &rest[21..43];
        let payload = &rest[43..];
        if auth_prefix != AUTH_FIXED_PREFIX {
            return Err(FrameError::BadAuth("unknown auth mechanism"));
        }
        let sig = cmdchan_crypto::sign_hmac_md5_base64(secret, payload);
        if !cmdchan_crypto::constant_time_eq(sig.as_bytes(), msig) {
            return Err(FrameError::BadAuth("signature mismatch"));
        }
    }

    let aes256z = table.get("_aes256z").cloned();
    let aes256 = table.get("_aes256").cloned();
    if aes256z.is_none() && aes256.is_none() {
        let mut table = table;
        if let Some(Value::Table(ctrl)) = table.get_mut("_ctrl") {
            ctrl.remove("_enc");
        }
        return Ok(table);
    }

    let (encrypted, compressed) = match aes256z {
        Some(v) => (v, true),
        None => (aes256.unwrap(), false),
    };
    let encrypted_bytes = encrypted
        .as_blob()
        .ok_or(FrameError::BadForm("encrypted input is not a string"))?;

    let secret = secret.ok_or(FrameError::NeedSecret)?;
    let key = cmdchan_crypto::derive_key(secret);
    let wire = cmdchan_crypto::decrypt_cbc(&key, encrypted_bytes)?;
    if wire.len() < 4 {
        return Err(FrameError::UnexpectedEnd);
    }
    let inner_len = u32::from_be_bytes(wire[0..4].try_into().unwrap()) as usize;
    let rest_wire = &wire[4..];

    let decompressed;
    let body_bytes: &[u8] = if compressed {
        decompressed = cmdchan_crypto::inflate_raw(rest_wire)?;
        if inner_len > decompressed.len() {
            return Err(FrameError::UnexpectedEnd);
        }
        &decompressed[..inner_len]
    } else {
        if inner_len > rest_wire.len() {
            return Err(FrameError::UnexpectedEnd);
        }
        &rest_wire[..inner_len]
    };

    let mut inner_table = decode_body(body_bytes)?;
    basic_syntax_checks(&inner_table, false)?;
    if let Some(Value::Table(ctrl)) = inner_table.get_mut("_ctrl") {
        ctrl.insert("_enc", "1");
    }
    Ok(inner_table)
}

fn basic_syntax_checks(message: &Table, maybe_encrypted: bool) -> Result<(), FrameError> {
    let encrypted =
        maybe_encrypted && (message.get("_aes256").is_some() || message.get("_aes256z").is_some());

    if !encrypted {
        let ctrl = message
            .get("_ctrl")
            .ok_or(FrameError::BadForm("_ctrl must be present"))?;
        if ctrl.as_table().is_none() {
            return Err(FrameError::BadForm("_ctrl must be a table"));
        }

        let data = message
            .get("_data")
            .ok_or(FrameError::BadForm("_data must be present"))?;
        let data = data
            .as_table()
            .ok_or(FrameError::BadForm("_data must be a table"))?;

        let ty = data
            .get("type")
            .ok_or(FrameError::BadForm("type must be present in _data"))?;
        if ty.as_str().is_none() {
            return Err(FrameError::BadForm("type must be a string"));
        }

        if let Some(err) = data.get("err") {
            if err.as_str().is_none() {
                return Err(FrameError::BadForm("err must be a string"));
            }
        }
    }

    if let Some(auth) = message.get("_auth") {
        if auth.as_table().is_none() {
            return Err(FrameError::BadForm("_auth must be a table"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_request() -> Table {
        let mut ctrl = Table::new();
        ctrl.insert("_snon", "123");
        ctrl.insert("_sseq", "1");
        ctrl.insert("_pnon", "0");
        let mut data = Table::new();
        data.insert("type", "version");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", data);
        message
    }

    #[test]
    fn unencrypted_roundtrip() {
        let message = version_request();
        let framed = to_wire(&message, None).unwrap();
        let len = u32::from_be_bytes(framed[0..4].try_into().unwrap()) as usize;
        assert_eq!(framed.len() - 4, len);
        let decoded = from_wire(&framed[4..], None).unwrap();
        assert_eq!(
            decoded.get_table("_data").unwrap().get_str("type"),
            Some("version")
        );
        assert!(!decoded.get_table("_ctrl").unwrap().contains_key("_enc"));
    }

    #[test]
    fn signed_roundtrip_detects_tamper() {
        let message = version_request();
        let mut framed = to_wire(&message, Some(b"s3cret")).unwrap();
        let decoded = from_wire(&framed[4..], Some(b"s3cret")).unwrap();
        assert_eq!(
            decoded.get_table("_data").unwrap().get_str("type"),
            Some("version")
        );

        // Flip a bit inside the 22-byte signature field itself (bytes 29..51
        // of `framed`: length prefix, version, then the _auth table's fixed
        // 21-byte prefix), leaving the message body untouched so this can
        // only surface as a signature mismatch, not a decode error.
        framed[35] ^= 0x01;
        let err = from_wire(&framed[4..], Some(b"s3cret")).unwrap_err();
        assert!(matches!(err, FrameError::BadAuth(_)));
    }

    #[test]
    fn encrypted_and_compressed_roundtrip() {
        let mut ctrl = Table::new();
        ctrl.insert("_snon", "123");
        ctrl.insert("_sseq", "1");
        ctrl.insert("_pnon", "0");
        ctrl.insert("_enc", "1");
        ctrl.insert("_comp", "1");
        let mut data = Table::new();
        data.insert("type", "version");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", data);

        let framed = to_wire(&message, Some(b"s3cret")).unwrap();
        let decoded = from_wire(&framed[4..], Some(b"s3cret")).unwrap();
        assert_eq!(decoded.get_table("_ctrl").unwrap().get_str("_enc"), Some("1"));
        assert_eq!(
            decoded.get_table("_data").unwrap().get_str("type"),
            Some("version")
        );
    }

    #[test]
    fn encrypted_without_secret_needs_secret() {
        let mut ctrl = Table::new();
        ctrl.insert("_enc", "1");
        let mut data = Table::new();
        data.insert("type", "version");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", data);

        assert_eq!(to_wire(&message, None).unwrap_err(), FrameError::NeedSecret);
    }

    #[test]
    fn missing_data_type_is_bad_form() {
        let mut ctrl = Table::new();
        ctrl.insert("_snon", "1");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", Table::new());

        let framed = to_wire(&message, None).unwrap();
        let err = from_wire(&framed[4..], None).unwrap_err();
        assert!(matches!(err, FrameError::BadForm(_)));
    }
}
