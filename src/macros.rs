//! Declarative helpers for the protocol tables (error codes, command codes, versions).

/// Declares `pub const` error codes and a `get_error_message` lookup.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:expr),* $(,)?) => {
        $(
            pub const $name: u32 = $code;
        )*

        /// Returns the human-readable message for a TinyTuya-style error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}

/// Declares the `CommandType` enum with a `from_u32` reverse lookup.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Command codes carried in the frame header.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val,)*
        }

        impl CommandType {
            pub fn from_u32(val: u32) -> Option<Self> {
                match val {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }
        }
    };
}

/// Declares the `Version` enum with its wire string and numeric value.
macro_rules! define_version {
    ($($name:ident = ($text:expr, $num:literal)),* $(,)?) => {
        /// Protocol versions understood by the transport.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Version {
            $($name,)*
        }

        impl Version {
            pub const ALL: &'static [Version] = &[$(Version::$name,)*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Version::$name => $text,)*
                }
            }

            pub fn val(&self) -> f32 {
                match self {
                    $(Version::$name => $num,)*
                }
            }

            /// Version string as sent in the 15-byte protocol header.
            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for Version {
            type Err = crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let num: f64 = s
                    .trim()
                    .parse()
                    .map_err(|_| crate::error::TuyaError::UnsupportedVersion(s.to_string()))?;
                Version::try_from(num)
            }
        }

        impl TryFrom<f64> for Version {
            type Error = crate::error::TuyaError;

            fn try_from(num: f64) -> std::result::Result<Self, Self::Error> {
                $(
                    if (num - $num as f64).abs() < 0.001 {
                        return Ok(Version::$name);
                    }
                )*
                Err(crate::error::TuyaError::UnsupportedVersion(num.to_string()))
            }
        }
    };
}
