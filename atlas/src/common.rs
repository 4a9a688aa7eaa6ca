pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::Itertools as _;
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
