pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use futures::{
    future::{self, FutureExt as _, TryFutureExt as _},
    stream::{self, Stream, StreamExt as _, TryStreamExt as _},
};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use par_stream::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fmt, fs, iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};
pub use structopt::StructOpt;
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, Module, ModuleT},
    Device, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tokio::sync::mpsc;
pub use tracing::{debug, info, info_span, warn, Span};

pub type Fallible<T> = Result<T>;
