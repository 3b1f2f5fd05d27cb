use crate::Error;
use std::{ffi::CStr, path::PathBuf, str::FromStr, time::Duration};

/// The environment variable [`Settings::from_env`] reads
pub const ENV_VAR: &str = "CRASH_BACKTRACE";

/// Declares a setting that is passed through to the backtracer as one of a
/// fixed set of words
macro_rules! arg_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $word:literal => $arg:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// The word passed to the backtracer
            pub fn as_arg(self) -> &'static CStr {
                match self {
                    $(Self::$variant => $arg,)+
                }
            }

            fn parse(s: &str) -> Option<Self> {
                $(
                    if s.eq_ignore_ascii_case($word) {
                        return Some(Self::$variant);
                    }
                )+
                None
            }
        }
    };
}

arg_enum! {
    /// How the backtracer unwinds the stacks
    pub enum Unwind {
        /// Frame pointers only
        Fast = "fast" => c"fast",
        /// Using the unwind tables, this is the default
        Precise = "precise" => c"precise",
    }
}

arg_enum! {
    /// How much the backtracer prints by default
    pub enum Preset {
        /// `Friendly` if interactive, `Full` otherwise
        Auto = "auto" => c"full",
        Friendly = "friendly" => c"friendly",
        Medium = "medium" => c"medium",
        Full = "full" => c"full",
    }
}

arg_enum! {
    /// Which threads are backtraced
    pub enum Threads {
        Preset = "preset" => c"preset",
        All = "all" => c"all",
        Crashed = "crashed" => c"crashed",
    }
}

arg_enum! {
    /// Which threads have their registers printed
    pub enum Registers {
        Preset = "preset" => c"preset",
        None = "none" => c"none",
        All = "all" => c"all",
        Crashed = "crashed" => c"crashed",
    }
}

arg_enum! {
    /// Which loaded images are listed
    pub enum Images {
        Preset = "preset" => c"preset",
        None = "none" => c"none",
        All = "all" => c"all",
        Mentioned = "mentioned" => c"mentioned",
    }
}

arg_enum! {
    /// Where the backtracer writes its report
    pub enum OutputTo {
        /// `Stdout` if interactive, `Stderr` otherwise
        Auto = "auto" => c"stderr",
        Stdout = "stdout" => c"stdout",
        Stderr = "stderr" => c"stderr",
    }
}

/// A switch that can also be decided by whether we are attached to a terminal
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Toggle {
    On,
    Off,
    Tty,
}

impl Toggle {
    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("tty") {
            Some(Self::Tty)
        } else {
            parse_bool(s).map(Self::from)
        }
    }

    #[inline]
    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

impl From<bool> for Toggle {
    fn from(b: bool) -> Self {
        if b { Self::On } else { Self::Off }
    }
}

/// Whether sensitive information, eg. environment variables, is scrubbed from
/// the report
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Sanitize {
    Preset,
    On,
    Off,
}

impl Sanitize {
    pub fn as_arg(self) -> &'static CStr {
        match self {
            Self::Preset => c"preset",
            Self::On => c"true",
            Self::Off => c"false",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("preset") {
            Some(Self::Preset)
        } else {
            parse_bool(s).map(|b| if b { Self::On } else { Self::Off })
        }
    }
}

/// Renders a boolean the way the backtracer expects it
#[inline]
pub fn bool_arg(b: bool) -> &'static CStr {
    if b { c"true" } else { c"false" }
}

fn parse_bool(s: &str) -> Option<bool> {
    const TRUE: &[&str] = &["yes", "true", "on", "1", "y", "t"];
    const FALSE: &[&str] = &["no", "false", "off", "0", "n", "f"];

    if TRUE.iter().any(|t| s.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if FALSE.iter().any(|f| s.eq_ignore_ascii_case(f)) {
        Some(false)
    } else {
        None
    }
}

/// Configures what happens when we crash.
///
/// Everything but [`Self::enabled`], [`Self::backtracer_path`] and
/// [`Self::memserver`] is passed through to the backtracer as command line
/// arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// If false, [`crate::CrashHandler::attach`] installs nothing
    pub enabled: bool,
    pub unwind: Unwind,
    pub demangle: bool,
    /// Whether the backtracer may prompt the user once it has printed the
    /// crash
    pub interactive: Toggle,
    pub color: Toggle,
    /// How long the backtracer may take before giving up
    pub timeout: Duration,
    pub preset: Preset,
    pub threads: Threads,
    pub registers: Registers,
    pub images: Images,
    /// Maximum number of frames per thread, `None` for no limit
    pub limit: Option<u32>,
    /// Number of frames at the top of the stack that are always shown, even
    /// if the limit is hit
    pub top: u32,
    pub sanitize: Sanitize,
    /// Whether the backtracer may cache symbol information
    pub cache: bool,
    pub output_to: OutputTo,
    /// The backtracer executable
    pub backtracer_path: Option<PathBuf>,
    /// Where the memory server runs
    pub memserver: memserver::Mode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            unwind: Unwind::Precise,
            demangle: true,
            interactive: Toggle::Tty,
            color: Toggle::Tty,
            timeout: Duration::from_secs(30),
            preset: Preset::Auto,
            threads: Threads::Preset,
            registers: Registers::Preset,
            images: Images::Preset,
            limit: Some(64),
            top: 16,
            sanitize: Sanitize::Preset,
            cache: true,
            output_to: OutputTo::Stdout,
            backtracer_path: None,
            memserver: memserver::Mode::Thread,
        }
    }
}

impl Settings {
    /// Parses the settings from the `CRASH_BACKTRACE` environment variable,
    /// returning the defaults if it isn't set
    pub fn from_env() -> Result<Self, Error> {
        match std::env::var(ENV_VAR) {
            Ok(s) => s.parse(),
            Err(std::env::VarError::NotPresent) => Ok(Self::default()),
            Err(std::env::VarError::NotUnicode(s)) => Err(Error::InvalidSetting {
                key: ENV_VAR.to_owned(),
                value: s.to_string_lossy().into_owned(),
            }),
        }
    }

    /// Replaces every setting that depends on the environment we are running
    /// in with a concrete value, so that nothing needs to be decided when we
    /// crash
    pub fn resolve(&self) -> Self {
        let mut resolved = self.clone();

        if resolved.interactive == Toggle::Tty {
            resolved.interactive = Toggle::from(isatty(0) && isatty(1));
        }
        let interactive = resolved.interactive.is_on();

        if resolved.output_to == OutputTo::Auto {
            resolved.output_to = if interactive {
                OutputTo::Stdout
            } else {
                OutputTo::Stderr
            };
        }

        if resolved.color == Toggle::Tty {
            let fd = match resolved.output_to {
                OutputTo::Stdout => 1,
                _ => 2,
            };
            resolved.color = Toggle::from(isatty(fd));
        }

        if resolved.preset == Preset::Auto {
            resolved.preset = if interactive {
                Preset::Friendly
            } else {
                Preset::Full
            };
        }

        resolved
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        fn check<T>(key: &str, value: &str, parsed: Option<T>) -> Result<T, Error> {
            parsed.ok_or_else(|| Error::InvalidSetting {
                key: key.to_owned(),
                value: value.to_owned(),
            })
        }

        match key {
            "enable" | "enabled" => self.enabled = check(key, value, parse_bool(value))?,
            "unwind" => self.unwind = check(key, value, Unwind::parse(value))?,
            "demangle" => self.demangle = check(key, value, parse_bool(value))?,
            "interactive" => self.interactive = check(key, value, Toggle::parse(value))?,
            "color" => self.color = check(key, value, Toggle::parse(value))?,
            "timeout" => {
                let secs = if value.eq_ignore_ascii_case("none") {
                    Some(0)
                } else {
                    value.strip_suffix('s').unwrap_or(value).parse().ok()
                };
                self.timeout = Duration::from_secs(check(key, value, secs)?);
            }
            "preset" => self.preset = check(key, value, Preset::parse(value))?,
            "threads" => self.threads = check(key, value, Threads::parse(value))?,
            "registers" => self.registers = check(key, value, Registers::parse(value))?,
            "images" => self.images = check(key, value, Images::parse(value))?,
            "limit" => {
                self.limit = if value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(check(key, value, value.parse().ok())?)
                };
            }
            "top" => self.top = check(key, value, value.parse().ok())?,
            "sanitize" => self.sanitize = check(key, value, Sanitize::parse(value))?,
            "cache" => self.cache = check(key, value, parse_bool(value))?,
            "output-to" => self.output_to = check(key, value, OutputTo::parse(value))?,
            "backtracer" => {
                self.backtracer_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "memserver" => {
                self.memserver = match value {
                    "thread" => memserver::Mode::Thread,
                    "process" => memserver::Mode::Process,
                    _ => check(key, value, None)?,
                };
            }
            unknown => return Err(Error::UnknownSetting(unknown.to_owned())),
        }

        Ok(())
    }
}

impl FromStr for Settings {
    type Err = Error;

    /// Parses a comma separated list of `key=value` pairs, starting from the
    /// defaults
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut settings = Self::default();

        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(Error::InvalidSetting {
                    key: pair.to_owned(),
                    value: String::new(),
                });
            };

            settings.set(key.trim(), value.trim())?;
        }

        log::debug!("parsed crash settings {settings:?}");
        Ok(settings)
    }
}

#[inline]
fn isatty(fd: libc::c_int) -> bool {
    // SAFETY: syscall
    unsafe { libc::isatty(fd) == 1 }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_is_default() {
        assert_eq!("".parse::<Settings>().unwrap(), Settings::default());
        assert_eq!(" , ,".parse::<Settings>().unwrap(), Settings::default());
    }

    #[test]
    fn parses_everything() {
        let s: Settings = "enable=no, unwind=fast,demangle=off,interactive=yes,color=tty,\
            timeout=10s,preset=medium,threads=all,registers=crashed,images=mentioned,\
            limit=none,top=4,sanitize=1,cache=false,output-to=stderr,\
            backtracer=/usr/bin/bt,memserver=process"
            .parse()
            .unwrap();

        assert_eq!(
            s,
            Settings {
                enabled: false,
                unwind: Unwind::Fast,
                demangle: false,
                interactive: Toggle::On,
                color: Toggle::Tty,
                timeout: Duration::from_secs(10),
                preset: Preset::Medium,
                threads: Threads::All,
                registers: Registers::Crashed,
                images: Images::Mentioned,
                limit: None,
                top: 4,
                sanitize: Sanitize::On,
                cache: false,
                output_to: OutputTo::Stderr,
                backtracer_path: Some("/usr/bin/bt".into()),
                memserver: memserver::Mode::Process,
            }
        );
    }

    #[test]
    fn timeouts() {
        let parse = |s: &str| s.parse::<Settings>().map(|s| s.timeout.as_secs());

        assert_eq!(parse("timeout=5").unwrap(), 5);
        assert_eq!(parse("timeout=120s").unwrap(), 120);
        assert_eq!(parse("timeout=none").unwrap(), 0);
        assert!(matches!(
            parse("timeout=soon"),
            Err(Error::InvalidSetting { key, value }) if key == "timeout" && value == "soon"
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            "demangle=maybe".parse::<Settings>(),
            Err(Error::InvalidSetting { .. })
        ));
        assert!(matches!(
            "limit=-1".parse::<Settings>(),
            Err(Error::InvalidSetting { .. })
        ));
        assert!(matches!(
            "memserver=fork".parse::<Settings>(),
            Err(Error::InvalidSetting { .. })
        ));
        assert!(matches!(
            "cache".parse::<Settings>(),
            Err(Error::InvalidSetting { .. })
        ));
        assert!(matches!(
            "colour=on".parse::<Settings>(),
            Err(Error::UnknownSetting(k)) if k == "colour"
        ));
    }

    #[test]
    fn resolves_auto() {
        let friendly = Settings {
            interactive: Toggle::On,
            color: Toggle::Off,
            output_to: OutputTo::Auto,
            ..Default::default()
        }
        .resolve();

        assert_eq!(friendly.preset, Preset::Friendly);
        assert_eq!(friendly.output_to, OutputTo::Stdout);
        assert_eq!(friendly.color, Toggle::Off);

        let full = Settings {
            interactive: Toggle::Off,
            output_to: OutputTo::Auto,
            ..Default::default()
        }
        .resolve();

        assert_eq!(full.preset, Preset::Full);
        assert_eq!(full.output_to, OutputTo::Stderr);
        assert_ne!(full.color, Toggle::Tty);

        // Explicit choices are left alone
        let medium = Settings {
            interactive: Toggle::On,
            preset: Preset::Medium,
            ..Default::default()
        }
        .resolve();
        assert_eq!(medium.preset, Preset::Medium);
    }

    #[test]
    fn args() {
        assert_eq!(Preset::Auto.as_arg(), c"full");
        assert_eq!(OutputTo::Auto.as_arg(), c"stderr");
        assert_eq!(Sanitize::Off.as_arg(), c"false");
        assert_eq!(Registers::None.as_arg(), c"none");
        assert_eq!(bool_arg(true), c"true");
    }
}
