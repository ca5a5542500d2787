//! Client-requested reference updates

use std::fmt;

use crate::object::ObjectId;
use crate::protocol::ProtocolError;
use crate::store::{self, ObjectStore};

/// What a transaction does to its reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Create,
    Update,
    Delete,
}

/// One `<old> <new> <name>` command from a push
///
/// Parsing never touches storage; [`RefTransaction::apply`] performs the
/// compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTransaction {
    name: String,
    old: ObjectId,
    new: ObjectId,
}

impl RefTransaction {
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }

    /// Parse a command line
    ///
    /// Anything after the first NUL is the client's capability list and is
    /// ignored, with or without a separating space.
    pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
        let command = match line.iter().position(|b| *b == 0) {
            Some(nul) => &line[..nul],
            None => line,
        };
        let command = std::str::from_utf8(command)
            .map_err(|_| ProtocolError::Parse("command is not valid UTF-8".into()))?
            .trim();

        let tokens: Vec<&str> = command.split_whitespace().collect();
        let [old, new, name] = tokens.as_slice() else {
            return Err(ProtocolError::Parse(format!("invalid line: {}", command)));
        };

        let parse_id = |hex: &str| {
            ObjectId::from_hex(hex)
                .map_err(|e| ProtocolError::Parse(format!("invalid object id '{}': {}", hex, e)))
        };
        let old = parse_id(*old)?;
        let new = parse_id(*new)?;
        if old.is_null() && new.is_null() {
            return Err(ProtocolError::Parse(format!(
                "both old and new ids are null for {}",
                name
            )));
        }

        Ok(Self::new(*name, old, new))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value the client expects the reference to have now
    pub fn old(&self) -> ObjectId {
        self.old
    }

    /// Value the reference should have afterwards
    pub fn new_id(&self) -> ObjectId {
        self.new
    }

    pub fn kind(&self) -> UpdateKind {
        if self.old.is_null() {
            UpdateKind::Create
        } else if self.new.is_null() {
            UpdateKind::Delete
        } else {
            UpdateKind::Update
        }
    }

    /// Compare-and-set the reference in `store`
    pub async fn apply(&self, store: &dyn ObjectStore) -> store::Result<()> {
        store.compare_and_set(&self.name, self.new, self.old).await
    }
}

impl fmt::Display for RefTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old, self.new, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};

    const A: &str = "0a53e9ddeaddad63ad106860237bbf53411d11a7";
    const B: &str = "441b40d833fdfa93eb2908e52742248faf0ee993";
    const ZERO: &str = "0000000000000000000000000000000000000000";

    #[test]
    fn test_parse_with_capabilities() {
        let line = format!("{} {} refs/heads/master\0 report-status", A, B);
        let tx = RefTransaction::parse(line.as_bytes()).unwrap();
        assert_eq!(tx.name(), "refs/heads/master");
        assert_eq!(tx.old().to_hex(), A);
        assert_eq!(tx.new_id().to_hex(), B);
        assert_eq!(tx.kind(), UpdateKind::Update);
    }

    #[test]
    fn test_parse_capabilities_without_space() {
        let line = format!("{} {} refs/heads/master\0report-status side-band-64k", ZERO, B);
        let tx = RefTransaction::parse(line.as_bytes()).unwrap();
        assert_eq!(tx.kind(), UpdateKind::Create);
        assert_eq!(tx.name(), "refs/heads/master");
    }

    #[test]
    fn test_parse_trailing_newline() {
        let line = format!("{} {} refs/tags/v1\n", A, ZERO);
        let tx = RefTransaction::parse(line.as_bytes()).unwrap();
        assert_eq!(tx.kind(), UpdateKind::Delete);
        assert_eq!(tx.name(), "refs/tags/v1");
    }

    #[test]
    fn test_parse_errors() {
        for line in [
            format!("{} {}", A, B),
            format!("{} {} refs/heads/a extra", A, B),
            format!("{} nothex refs/heads/a", A),
            format!("{} {} refs/heads/a", ZERO, ZERO),
            String::new(),
        ] {
            assert!(
                matches!(
                    RefTransaction::parse(line.as_bytes()),
                    Err(ProtocolError::Parse(_))
                ),
                "{:?}",
                line
            );
        }
    }

    #[tokio::test]
    async fn test_apply_uses_old_value_as_expectation() {
        let store = MemoryStore::new();
        let a: ObjectId = A.parse().unwrap();
        let b: ObjectId = B.parse().unwrap();

        RefTransaction::new("refs/heads/master", ObjectId::null(), a)
            .apply(&store)
            .await
            .unwrap();

        let stale = RefTransaction::new("refs/heads/master", b, a);
        assert!(matches!(
            stale.apply(&store).await,
            Err(StoreError::ReferenceChanged { .. })
        ));

        RefTransaction::new("refs/heads/master", a, b)
            .apply(&store)
            .await
            .unwrap();
        assert_eq!(store.resolve("refs/heads/master").await.unwrap(), Some(b));
    }
}
