//! The opaque remote-procedure-call collaborator used to administer a broker node.

/// A term returned by a remote call, shaped after Erlang terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcValue {
    Atom(String),
    Binary(Vec<u8>),
    Long(i64),
    List(Vec<RpcValue>),
    Tuple(Vec<RpcValue>),
}

impl RpcValue {
    pub fn atom(name: impl Into<String>) -> Self {
        Self::Atom(name.into())
    }

    pub fn binary(text: impl AsRef<str>) -> Self {
        Self::Binary(text.as_ref().as_bytes().to_vec())
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Self::Atom(name) => Some(name),
            _ => None,
        }
    }

    /// Atoms, binaries and character lists, as text.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Atom(name) => Some(name.clone()),
            Self::Binary(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::List(chars) => chars
                .iter()
                .map(|c| match c {
                    Self::Long(code) => u32::try_from(*code).ok().and_then(char::from_u32),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[RpcValue]> {
        match self {
            Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Look `key` up in a property list, i.e. a list of `{Key, Value}` tuples.
    pub fn property(&self, key: &str) -> Option<&RpcValue> {
        self.as_list()?.iter().find_map(|item| match item.as_tuple()? {
            [name, value] if name.as_atom() == Some(key) => Some(value),
            _ => None,
        })
    }

    /// `ok` or a `{badrpc, Reason}` / `{error, Reason}` tuple.
    pub fn error_reason(&self) -> Option<&RpcValue> {
        match self.as_tuple()? {
            [tag, reason] if matches!(tag.as_atom(), Some("badrpc") | Some("error")) => {
                Some(reason)
            }
            _ => None,
        }
    }
}

/// Error returned by a [`BrokerRpc`] implementation.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    /// The node is up but refused our credentials (e.g. wrong cookie).
    #[error("Not authorised to connect to the broker node")]
    Auth(#[source] anyhow::Error),
    /// The node could not be reached or the call failed.
    #[error("Remote call to the broker node failed")]
    Call(#[source] anyhow::Error),
}

/// Executes a remote call on the broker node: `module:function(args...)`.
///
/// String arguments are passed as UTF-8 binaries.
#[async_trait::async_trait]
pub trait BrokerRpc: Send + Sync + 'static {
    async fn execute_rpc(
        &self,
        module: &str,
        function: &str,
        args: &[Vec<u8>],
    ) -> Result<RpcValue, RpcError>;
}
