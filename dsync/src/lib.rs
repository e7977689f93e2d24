//! Differential directory synchronization between hosts - `dsync`
//!
//! `dsync` mirrors a source directory into a destination directory on another
//! host, transferring only what changed:
//!
//! ```bash
//! # local source, remote destination
//! dsync /data/projects backup@archive:/srv/projects
//!
//! # both ends remote: the invoker only relays status
//! dsync -z --delete build@src-host:/out [fd00::7]:/mirror/out
//! ```
//!
//! Nothing has to be installed on the remote hosts: the running executable is
//! shipped over the remote shell's stdin, started from a temporary file and
//! unlinked as soon as it runs (see [`remote::deploy`]). A pre-installed binary
//! can be used instead with `--remote-binary`.
//!
//! # Roles
//!
//! - [`source`]: the source-side agent, serving listings, digests and file data
//! - [`destination`]: the destination-side agent, which computes the difference
//!   and applies it
//! - [`relay`]: the three-host mode, where the source agent itself runs remotely
//! - [`path`]: parsing of `[user@]host:dir` endpoints
//!
//! The agents talk over the remote shell's stdin/stdout using length-framed
//! commands; file contents travel over a separate TCP connection opened from the
//! source host to the destination host.
//!
//! # Exit codes
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | success |
//! | 1 | failure, including files skipped after integrity errors |
//! | 2 | the controlling process disappeared |
//! | 3 | the command channel ended unexpectedly |
//! | 4 | malformed data on the command channel |
//! | 5 | the remote shell failed |
//! | 6 | invalid configuration |

pub mod destination;
pub mod path;
pub mod relay;
pub mod source;
