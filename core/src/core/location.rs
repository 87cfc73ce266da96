// portflow/src/core/location.rs

use std::fmt;

/// Where a step, port or variable was declared. Filled in by whoever builds the step tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Location {
  pub system_id: Option<String>,
  pub line: Option<u32>,
  pub column: Option<u32>,
}

impl Location {
  pub fn new(system_id: impl Into<String>, line: u32, column: u32) -> Self {
    Self {
      system_id: Some(system_id.into()),
      line: Some(line),
      column: Some(column),
    }
  }

  pub fn unknown() -> Self {
    Self::default()
  }

  pub fn is_known(&self) -> bool {
    self.system_id.is_some() || self.line.is_some()
  }
}

impl fmt::Display for Location {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.is_known() {
      return f.write_str("unknown location");
    }
    f.write_str(self.system_id.as_deref().unwrap_or("<anonymous>"))?;
    if let Some(line) = self.line {
      write!(f, ":{}", line)?;
      if let Some(column) = self.column {
        write!(f, ":{}", column)?;
      }
    }
    Ok(())
  }
}
