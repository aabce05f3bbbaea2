//! Build matrix: architecture × interpreter version.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// CPU architecture axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" => Ok(Architecture::Amd64),
            "arm64" => Ok(Architecture::Arm64),
            other => Err(format!("unknown architecture '{other}' (expected amd64 or arm64)")),
        }
    }
}

/// Interpreter version selector, `MAJOR.MINOR`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PythonVersion(String);

impl PythonVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PythonVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        conda_env_manager::validate_python_version(s).map_err(|e| e.to_string())?;
        Ok(PythonVersion(s.to_string()))
    }
}

impl TryFrom<String> for PythonVersion {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PythonVersion> for String {
    fn from(v: PythonVersion) -> Self {
        v.0
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One combination of the matrix axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixCell {
    pub arch: Architecture,
    pub python: PythonVersion,
}

impl MatrixCell {
    pub fn new(arch: Architecture, python: PythonVersion) -> Self {
        Self { arch, python }
    }

    /// Stable identifier, e.g. `amd64-3.7`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.arch, self.python)
    }

    /// Ledger label, e.g. `weather@amd64-py3.7`.
    pub fn label(&self, package: &str) -> String {
        format!("{}@{}-py{}", package, self.arch, self.python)
    }
}

impl fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Expanded matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildMatrix {
    cells: Vec<MatrixCell>,
}

impl BuildMatrix {
    /// Cartesian product, architecture-major, keeping the given axis order.
    /// Duplicate axis values collapse.
    pub fn expand(archs: &[Architecture], pythons: &[PythonVersion]) -> Self {
        let mut cells = Vec::with_capacity(archs.len() * pythons.len());
        for arch in archs {
            for python in pythons {
                let cell = MatrixCell::new(*arch, python.clone());
                if !cells.contains(&cell) {
                    cells.push(cell);
                }
            }
        }
        Self { cells }
    }

    pub fn cells(&self) -> &[MatrixCell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Keep only the cells whose id is listed. An empty filter keeps all;
    /// an id that matches no cell is an error.
    pub fn filter(self, ids: &[String]) -> Result<Self, String> {
        if ids.is_empty() {
            return Ok(self);
        }
        for id in ids {
            if !self.cells.iter().any(|c| &c.id() == id) {
                let known: Vec<String> = self.cells.iter().map(MatrixCell::id).collect();
                return Err(format!(
                    "unknown cell '{}' (matrix has: {})",
                    id,
                    known.join(", ")
                ));
            }
        }
        let cells = self
            .cells
            .into_iter()
            .filter(|c| ids.contains(&c.id()))
            .collect();
        Ok(Self { cells })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn py(v: &str) -> PythonVersion {
        v.parse().unwrap()
    }

    fn default_matrix() -> BuildMatrix {
        BuildMatrix::expand(
            &[Architecture::Amd64, Architecture::Arm64],
            &[py("3.6"), py("3.7")],
        )
    }

    #[test]
    fn expands_to_four_cells_in_order() {
        let ids: Vec<String> = default_matrix().cells().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["amd64-3.6", "amd64-3.7", "arm64-3.6", "arm64-3.7"]);
    }

    #[test]
    fn duplicates_collapse() {
        let m = BuildMatrix::expand(&[Architecture::Amd64, Architecture::Amd64], &[py("3.7")]);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn empty_axis_gives_empty_matrix() {
        assert!(BuildMatrix::expand(&[], &[py("3.7")]).is_empty());
    }

    #[test]
    fn filter_selects_subset() {
        let m = default_matrix()
            .filter(&["arm64-3.7".to_string()])
            .unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.cells()[0].arch, Architecture::Arm64);
    }

    #[test]
    fn filter_rejects_unknown_cell() {
        let err = default_matrix()
            .filter(&["s390x-3.7".to_string()])
            .unwrap_err();
        assert!(err.contains("amd64-3.6"));
    }

    #[test]
    fn label_format() {
        let cell = MatrixCell::new(Architecture::Amd64, py("3.7"));
        assert_eq!(cell.label("weather"), "weather@amd64-py3.7");
    }

    #[test]
    fn python_version_deserialize_validates() {
        assert!(serde_json::from_str::<PythonVersion>("\"3.6\"").is_ok());
        assert!(serde_json::from_str::<PythonVersion>("\"3\"").is_err());
        assert!("riscv".parse::<Architecture>().is_err());
    }
}
