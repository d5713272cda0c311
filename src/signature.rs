// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! OpenPGP verification of repository release files.

Repositories publish either a clear-signed `InRelease` (RFC 4880 section 7)
or a plain `Release` with a detached `Release.gpg`. This module is a thin
front-end over the `pgp` crate that turns either form into a tri-state
[VerifyOutcome]. Trust policy (whether [VerifyOutcome::Unsigned] is
acceptable) is the caller's decision; a bad signature over present content
is always fatal.
*/

use {
    crate::error::{BuildError, Result},
    digest::Digest,
    pgp::{
        composed::{Deserializable, SignedPublicKey},
        crypto::{HashAlgorithm, Hasher},
        packet::Packet,
        types::{KeyTrait, PublicKeyTrait},
        Signature,
    },
    std::io::{self, Cursor, Read},
};

const CLEARTEXT_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_ARMOR: &str = "-----BEGIN PGP SIGNATURE-----";

/// Outcome of verifying a release file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyOutcome {
    /// At least one signature validated against a trusted key.
    Verified,
    /// No signatures were present, or no trusted keys are configured.
    Unsigned,
    /// Signatures were present and none validated against the trusted keys.
    Invalid,
}

/// Wrapper around content digesting to work around lack of clone() in the
/// pgp crate.
enum ReleaseHasher {
    Md5(md5::Md5),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl ReleaseHasher {
    fn for_algorithm(algorithm: HashAlgorithm) -> Option<Self> {
        match algorithm {
            HashAlgorithm::MD5 => Some(Self::Md5(md5::Md5::new())),
            HashAlgorithm::SHA1 => Some(Self::Sha1(sha1::Sha1::new())),
            HashAlgorithm::SHA2_256 => Some(Self::Sha256(sha2::Sha256::new())),
            HashAlgorithm::SHA2_384 => Some(Self::Sha384(sha2::Sha384::new())),
            HashAlgorithm::SHA2_512 => Some(Self::Sha512(sha2::Sha512::new())),
            _ => None,
        }
    }
}

impl io::Write for ReleaseHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Hasher for ReleaseHasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(digest) => digest.update(data),
            Self::Sha1(digest) => digest.update(data),
            Self::Sha256(digest) => digest.update(data),
            Self::Sha384(digest) => digest.update(data),
            Self::Sha512(digest) => digest.update(data),
        }
    }

    fn finish(self: Box<Self>) -> Vec<u8> {
        match *self {
            Self::Md5(digest) => digest.finalize().to_vec(),
            Self::Sha1(digest) => digest.finalize().to_vec(),
            Self::Sha256(digest) => digest.finalize().to_vec(),
            Self::Sha384(digest) => digest.finalize().to_vec(),
            Self::Sha512(digest) => digest.finalize().to_vec(),
        }
    }
}

/// Whether bytes look like a PGP clear-signed message.
pub fn is_clearsigned(data: &[u8]) -> bool {
    data.starts_with(CLEARTEXT_HEADER.as_bytes())
}

/// A clear-signed message split into its parts.
pub struct CleartextMessage {
    /// The embedded message with dash-escaping reversed, LF line endings.
    pub body: Vec<u8>,
    /// The canonical form the signatures cover (CRLF joined, no trailing EOL).
    digest_content: Vec<u8>,
    /// Parsed signature packets from the trailing armor.
    signatures: Vec<Signature>,
}

/// Split a clear-signed message into body and signatures.
///
/// Per RFC 4880 section 7.1: `- ` at line starts is stripped, the signed text
/// is canonicalized to CRLF line endings, and the line break before the
/// signature armor is not part of the signed text.
pub fn split_cleartext(data: &[u8]) -> Result<CleartextMessage> {
    let (body, digest_content, armor) = split_parts(data)?;
    let signatures = parse_signature_packets(armor.as_bytes())?;

    Ok(CleartextMessage {
        body,
        digest_content,
        signatures,
    })
}

/// The textual split underlying [split_cleartext]: body, canonical digest
/// content, and the raw signature armor.
fn split_parts(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>, String)> {
    let text = std::str::from_utf8(data)
        .map_err(|e| BuildError::ControlParse(format!("release file is not UTF-8: {}", e)))?;

    let mut lines = text.lines();

    match lines.next() {
        Some(line) if line.trim_end() == CLEARTEXT_HEADER => {}
        other => {
            return Err(BuildError::ControlParse(format!(
                "expected {}, got {:?}",
                CLEARTEXT_HEADER, other
            )))
        }
    }

    // Armor headers (`Hash: ...`) terminated by an empty line.
    for line in lines.by_ref() {
        if line.trim().is_empty() {
            break;
        }
    }

    let mut body = Vec::new();
    let mut digest_lines: Vec<&str> = vec![];
    let mut armor = String::new();
    let mut in_signature = false;

    for line in lines {
        if in_signature {
            armor.push_str(line);
            armor.push('\n');
            continue;
        }

        if line.trim_end() == SIGNATURE_ARMOR {
            in_signature = true;
            armor.push_str(SIGNATURE_ARMOR);
            armor.push('\n');
            continue;
        }

        let line = line.strip_prefix("- ").unwrap_or(line);
        body.extend_from_slice(line.as_bytes());
        body.push(b'\n');
        digest_lines.push(line);
    }

    if !in_signature {
        return Err(BuildError::ControlParse(
            "clear-signed message has no signature armor".to_string(),
        ));
    }

    let digest_content = digest_lines.join("\r\n").into_bytes();

    Ok((body, digest_content, armor))
}

/// Parse signature packets from armored or binary signature data.
fn parse_signature_packets(data: &[u8]) -> Result<Vec<Signature>> {
    let reader: Box<dyn Read> = if data.starts_with(SIGNATURE_ARMOR.as_bytes()) {
        let mut dearmor = pgp::armor::Dearmor::new(Cursor::new(data.to_vec()));
        dearmor.read_header()?;

        if !matches!(dearmor.typ, Some(pgp::armor::BlockType::Signature)) {
            return Err(BuildError::ControlParse(
                "armor block is not a PGP signature".to_string(),
            ));
        }

        Box::new(dearmor)
    } else {
        Box::new(Cursor::new(data.to_vec()))
    };

    let mut signatures = vec![];

    for packet in pgp::packet::PacketParser::new(reader) {
        match packet.map_err(pgp::errors::Error::from)? {
            Packet::Signature(signature) => signatures.push(signature),
            _ => {
                // Release signatures carry only signature packets; anything
                // else means the input is not what we were promised.
                return Err(BuildError::ControlParse(
                    "unexpected PGP packet in signature data".to_string(),
                ));
            }
        }
    }

    Ok(signatures)
}

/// Verify one signature over already-canonicalized content.
fn signature_verifies(content: &[u8], signature: &Signature, key: &SignedPublicKey) -> bool {
    let issuer_matches = match signature.issuer() {
        Some(issuer) => &key.key_id() == issuer || key.public_subkeys.iter().any(|sub| &sub.key_id() == issuer),
        None => false,
    };

    if !issuer_matches {
        return false;
    }

    let mut hasher = match ReleaseHasher::for_algorithm(signature.config.hash_alg) {
        Some(hasher) => Box::new(hasher),
        None => return false,
    };

    hasher.update(content);

    let len = match signature.config.hash_signature_data(&mut *hasher) {
        Ok(len) => len,
        Err(_) => return false,
    };
    hasher.update(&signature.config.trailer(len));

    let digest = hasher.finish();

    if digest[0..2] != signature.signed_hash_value {
        return false;
    }

    if key
        .verify_signature(signature.config.hash_alg, &digest, &signature.signature)
        .is_ok()
    {
        return true;
    }

    key.public_subkeys.iter().any(|sub| {
        sub.verify_signature(signature.config.hash_alg, &digest, &signature.signature)
            .is_ok()
    })
}

/// A set of trusted public keys supplied by configuration.
#[derive(Default)]
pub struct Keyring {
    keys: Vec<SignedPublicKey>,
}

impl Keyring {
    /// Whether any keys are loaded.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of loaded keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Add an ASCII-armored public key.
    pub fn add_armored_key(&mut self, armored: &str) -> Result<()> {
        let (key, _) = SignedPublicKey::from_string(armored)?;
        self.keys.push(key);

        Ok(())
    }

    fn verify_signatures(&self, content: &[u8], signatures: &[Signature]) -> VerifyOutcome {
        if signatures.is_empty() || self.keys.is_empty() {
            return VerifyOutcome::Unsigned;
        }

        for signature in signatures {
            for key in &self.keys {
                if signature_verifies(content, signature, key) {
                    return VerifyOutcome::Verified;
                }
            }
        }

        VerifyOutcome::Invalid
    }

    /// Verify a clear-signed `InRelease` file.
    ///
    /// Returns the embedded release body together with the outcome, so the
    /// caller can proceed with parsing when its trust policy allows
    /// [VerifyOutcome::Unsigned].
    pub fn verify_inline(&self, data: &[u8]) -> Result<(Vec<u8>, VerifyOutcome)> {
        let message = split_cleartext(data)?;
        let outcome = self.verify_signatures(&message.digest_content, &message.signatures);

        Ok((message.body, outcome))
    }

    /// Verify a detached signature (`Release.gpg`) over release content.
    pub fn verify_detached(&self, content: &[u8], signature: &[u8]) -> Result<VerifyOutcome> {
        let signatures = parse_signature_packets(signature)?;

        Ok(self.verify_signatures(content, &signatures))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SIGNED: &str = "-----BEGIN PGP SIGNED MESSAGE-----\n\
Hash: SHA256\n\
\n\
Origin: Test\n\
Suite: stable\n\
- -----Escaped line\n\
\n\
-----BEGIN PGP SIGNATURE-----\n\
\n\
iQEzBAEBCAAdFiEEdummydummydummydummydummydummyAFAmDummyACgkQdummy\n\
=aaaa\n\
-----END PGP SIGNATURE-----\n";

    #[test]
    fn detects_clearsigned() {
        assert!(is_clearsigned(SIGNED.as_bytes()));
        assert!(!is_clearsigned(b"Origin: Test\n"));
    }

    #[test]
    fn splits_body_and_unescapes() {
        // The armor here is not decodable; only the textual split is under
        // test.
        let (body, digest_content, armor) = split_parts(SIGNED.as_bytes()).unwrap();

        assert_eq!(
            body,
            b"Origin: Test\nSuite: stable\n-----Escaped line\n\n".to_vec()
        );
        // Signed text is CRLF-joined without the EOL before the armor.
        assert_eq!(
            digest_content,
            b"Origin: Test\r\nSuite: stable\r\n-----Escaped line\r\n".to_vec()
        );
        assert!(armor.starts_with("-----BEGIN PGP SIGNATURE-----"));
    }

    #[test]
    fn missing_armor_is_error() {
        let res = split_cleartext(b"-----BEGIN PGP SIGNED MESSAGE-----\n\nOrigin: Test\n");
        assert!(res.is_err());
    }

    #[test]
    fn empty_keyring_is_unsigned() {
        let keyring = Keyring::default();
        assert_eq!(
            keyring.verify_signatures(b"content", &[]),
            VerifyOutcome::Unsigned
        );
    }
}
