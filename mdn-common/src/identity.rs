//! Saved daemon identity.
//!
//! Each daemon persists `(id, bind endpoint, rendezvous)` under its data
//! directory so a restart rejoins the cluster under the same identity
//! instead of registering anew.

use std::fs;
use std::path::Path;

use rand::RngCore;

use crate::error::{MdnError, MdnResult};
use crate::ids::CommId;

const IDENTITY_HEADER: &str = "meridian-identity v1";

/// Identity loaded from or about to be saved to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedIdentity {
    /// Node identity.
    pub id: CommId,
    /// Endpoint this daemon binds its listener to.
    pub bind_to: String,
    /// Coordinator rendezvous endpoint.
    pub rendezvous: String,
}

/// Result of [`load_or_generate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityOutcome {
    /// The effective identity.
    pub identity: SavedIdentity,
    /// Whether the identity came from a prior save (true) or was freshly
    /// generated (false). Fresh identities still need registration with the
    /// coordinator before first use.
    pub saved: bool,
}

/// Loads a prior identity from `path`, or generates a fresh one.
///
/// A saved bind endpoint or rendezvous is overridden by the caller-provided
/// value when one is given, matching restart-with-new-flags behavior.
///
/// # Errors
///
/// Returns `MdnError::Io` for filesystem failures and `MdnError::Protocol`
/// when an existing identity file is malformed.
pub fn load_or_generate<P: AsRef<Path>>(
    path: P,
    bind_to: &str,
    rendezvous: &str,
) -> MdnResult<IdentityOutcome> {
    let path = path.as_ref();
    if path.exists() {
        let prior = load(path)?;
        return Ok(IdentityOutcome {
            identity: SavedIdentity {
                id: prior.id,
                bind_to: bind_to.to_owned(),
                rendezvous: rendezvous.to_owned(),
            },
            saved: true,
        });
    }

    let mut rng = rand::thread_rng();
    let mut id = rng.next_u64();
    // Zero is reserved as the unset sentinel in wire payloads.
    while id == 0 {
        id = rng.next_u64();
    }
    Ok(IdentityOutcome {
        identity: SavedIdentity {
            id: CommId::new(id),
            bind_to: bind_to.to_owned(),
            rendezvous: rendezvous.to_owned(),
        },
        saved: false,
    })
}

/// Loads a saved identity file.
///
/// # Errors
///
/// Returns `MdnError::Io` for read failures and `MdnError::Protocol` when
/// the file does not carry the expected header or field layout.
pub fn load<P: AsRef<Path>>(path: P) -> MdnResult<SavedIdentity> {
    let text = fs::read_to_string(path.as_ref())
        .map_err(|error| MdnError::Io(format!("read identity file failed: {error}")))?;
    let mut lines = text.lines();

    if lines.next() != Some(IDENTITY_HEADER) {
        return Err(MdnError::Protocol(
            "identity file is missing its header".to_owned(),
        ));
    }
    let id_text = lines
        .next()
        .ok_or_else(|| MdnError::Protocol("identity file is missing the id line".to_owned()))?;
    let id = id_text
        .parse::<u64>()
        .map_err(|_| MdnError::Protocol(format!("identity id is not a u64: {id_text}")))?;
    let bind_to = lines
        .next()
        .ok_or_else(|| MdnError::Protocol("identity file is missing the bind line".to_owned()))?
        .to_owned();
    let rendezvous = lines
        .next()
        .ok_or_else(|| {
            MdnError::Protocol("identity file is missing the rendezvous line".to_owned())
        })?
        .to_owned();

    Ok(SavedIdentity {
        id: CommId::new(id),
        bind_to,
        rendezvous,
    })
}

/// Persists one identity, creating parent directories as needed.
///
/// # Errors
///
/// Returns `MdnError::Io` for filesystem failures.
pub fn save<P: AsRef<Path>>(path: P, identity: &SavedIdentity) -> MdnResult<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| MdnError::Io(format!("create identity directory failed: {error}")))?;
    }
    let payload = format!(
        "{IDENTITY_HEADER}\n{}\n{}\n{}\n",
        identity.id.get(),
        identity.bind_to,
        identity.rendezvous
    );
    fs::write(path, payload)
        .map_err(|error| MdnError::Io(format!("write identity file failed: {error}")))
}

#[cfg(test)]
mod tests {
    use super::{load, load_or_generate, save, SavedIdentity};
    use crate::ids::CommId;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir must be creatable");
        let path = dir.path().join("TXMAN");
        let identity = SavedIdentity {
            id: CommId::new(77),
            bind_to: "127.0.0.1:2200".to_owned(),
            rendezvous: "127.0.0.1:1982".to_owned(),
        };

        save(&path, &identity).expect("save should succeed");
        let loaded = load(&path).expect("load should succeed");
        assert_that!(&loaded, eq(&identity));
    }

    #[rstest]
    fn generate_assigns_nonzero_id_when_no_prior_identity() {
        let dir = tempfile::tempdir().expect("tempdir must be creatable");
        let outcome = load_or_generate(dir.path().join("KVS"), "h:1", "c:2")
            .expect("generation should succeed");
        assert_that!(outcome.saved, eq(false));
        assert_that!(outcome.identity.id.get() != 0, eq(true));
    }

    #[rstest]
    fn reload_keeps_id_but_adopts_new_endpoints() {
        let dir = tempfile::tempdir().expect("tempdir must be creatable");
        let path = dir.path().join("KVS");
        save(
            &path,
            &SavedIdentity {
                id: CommId::new(9),
                bind_to: "old:1".to_owned(),
                rendezvous: "old:2".to_owned(),
            },
        )
        .expect("save should succeed");

        let outcome =
            load_or_generate(&path, "new:1", "new:2").expect("reload should succeed");
        assert_that!(outcome.saved, eq(true));
        assert_that!(outcome.identity.id, eq(CommId::new(9)));
        assert_that!(&outcome.identity.bind_to, eq(&"new:1".to_owned()));
        assert_that!(&outcome.identity.rendezvous, eq(&"new:2".to_owned()));
    }

    #[rstest]
    fn malformed_identity_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir must be creatable");
        let path = dir.path().join("TXMAN");
        std::fs::write(&path, "not an identity file").expect("write should succeed");
        assert_that!(load(&path).is_err(), eq(true));
    }
}
