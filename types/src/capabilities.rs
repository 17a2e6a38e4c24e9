use serde_json::Value;

/// Snapshot of what the server advertised in its `initialize` result.
///
/// Kept as raw JSON: the client only needs presence checks, not the full
/// LSP capability schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCapabilities {
    capabilities: Value,
    server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: Option<String>,
}

impl ServerCapabilities {
    /// Extract capabilities from an `initialize` result.
    ///
    /// The result must be an object whose `capabilities` member is an object.
    pub fn from_initialize_result(result: &Value) -> Result<Self, String> {
        let Some(obj) = result.as_object() else {
            return Err(format!("initialize result is not an object: {result}"));
        };
        let capabilities = match obj.get("capabilities") {
            Some(caps @ Value::Object(_)) => caps.clone(),
            Some(other) => return Err(format!("`capabilities` is not an object: {other}")),
            None => return Err("initialize result has no `capabilities`".to_string()),
        };
        let server_info = obj.get("serverInfo").and_then(|info| {
            Some(ServerInfo {
                name: info.get("name")?.as_str()?.to_string(),
                version: info
                    .get("version")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            })
        });
        Ok(Self {
            capabilities,
            server_info,
        })
    }

    /// Whether a provider is advertised: present and not `false`/`null`.
    ///
    /// Accepts a dotted path for nested entries, e.g. `workspace.fileOperations`.
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        match self.get(capability) {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    #[must_use]
    pub fn get(&self, capability: &str) -> Option<&Value> {
        capability
            .split('.')
            .try_fold(&self.capabilities, |value, key| value.get(key))
    }

    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.capabilities
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }
}
