use std::{collections::BTreeSet, fmt, str::FromStr};

/// Identifies a population of proxies that receive the same configuration snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerGroup {
    /// The service the proxies front.
    pub service_name: String,
    pub view: View,
    pub dependencies: Dependencies,
}

/// Which zones' endpoints a group sees.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum View {
    /// Every zone, remote zones at a lower priority.
    Global,
    /// Only the local zone.
    Local,
}

/// Which services a group routes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependencies {
    /// Every known service (a wildcard dependency).
    All,
    Services(BTreeSet<String>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidGroup {
    #[error("consumer group must name a service")]
    MissingName,

    #[error("unknown view '{0}', expected 'global' or 'local'")]
    UnknownView(String),
}

// === impl ConsumerGroup ===

impl ConsumerGroup {
    pub fn all_services(service_name: impl ToString) -> Self {
        Self {
            service_name: service_name.to_string(),
            view: View::Global,
            dependencies: Dependencies::All,
        }
    }

    pub fn services<I, S>(service_name: impl ToString, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        Self {
            service_name: service_name.to_string(),
            view: View::Global,
            dependencies: Dependencies::Services(
                dependencies.into_iter().map(|s| s.to_string()).collect(),
            ),
        }
    }

    pub fn with_view(mut self, view: View) -> Self {
        self.view = view;
        self
    }

    /// Wildcard groups depend on every service, so any change affects them.
    pub fn is_wildcard(&self) -> bool {
        matches!(self.dependencies, Dependencies::All)
    }

    pub fn depends_on(&self, service: &str) -> bool {
        match &self.dependencies {
            Dependencies::All => true,
            Dependencies::Services(services) => services.contains(service),
        }
    }
}

impl fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.service_name)?;
        if self.view == View::Local {
            f.write_str(":local")?;
        }
        match &self.dependencies {
            Dependencies::All => f.write_str("=*"),
            Dependencies::Services(services) => {
                f.write_str("=")?;
                for (i, service) in services.iter().enumerate() {
                    if i > 0 {
                        f.write_str("+")?;
                    }
                    f.write_str(service)?;
                }
                Ok(())
            }
        }
    }
}

/// Parses `name[:global|:local][=*|=dep1+dep2]`. Groups without a dependency list depend on all
/// services.
impl FromStr for ConsumerGroup {
    type Err = InvalidGroup;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, deps) = match s.split_once('=') {
            Some((head, deps)) => (head, Some(deps)),
            None => (s, None),
        };
        let (name, view) = match head.split_once(':') {
            Some((name, "global")) => (name, View::Global),
            Some((name, "local")) => (name, View::Local),
            Some((_, view)) => return Err(InvalidGroup::UnknownView(view.to_string())),
            None => (head, View::Global),
        };
        let name = name.trim();
        if name.is_empty() {
            return Err(InvalidGroup::MissingName);
        }

        let dependencies = match deps.map(str::trim) {
            None | Some("*") => Dependencies::All,
            Some(deps) => Dependencies::Services(
                deps.split('+')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            ),
        };

        Ok(Self {
            service_name: name.to_string(),
            view,
            dependencies,
        })
    }
}
