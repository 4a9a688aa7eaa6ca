pub use crate::error::{Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use atlas::{Atlas, Hierarchy, HttClass, Rgb};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{iproduct, izip, Itertools as _};
pub use log::{debug, info, warn};
pub use ndarray::{
    s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1, ArrayViewMut2, Axis, Zip,
};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::{self, Ordering},
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Instant,
};
