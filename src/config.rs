use crate::{CinderError, Result};

pub const DEFAULT_PORT: u16 = 6530;
pub const DEFAULT_NUM_VTS: usize = 4;
pub const MAX_VTS: usize = 12;
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 25;

#[derive(Clone, Debug)]
pub struct Config {
    pub daemon: bool,
    pub enable_vts: bool,
    pub enable_vt1: bool,
    pub enable_gfx: bool,
    pub num_vts: usize,
    pub pre_create_vts: bool,
    pub no_login: bool,
    pub splash_only: bool,
    pub dev_mode: bool,
    pub print_resolution: bool,
    pub port: u16,
    pub frame_interval_ms: u64,
    pub loop_start: i32,
    pub loop_count: i32,
    pub loop_interval_ms: u64,
    pub loop_offset: (i32, i32),
    pub offset: (i32, i32),
    pub scale: u32,
    pub clear_color: u32,
    pub images: Vec<String>,
    pub images_hires: Vec<String>,
    pub splash_frames: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: false,
            enable_vts: false,
            enable_vt1: false,
            enable_gfx: false,
            num_vts: DEFAULT_NUM_VTS,
            pre_create_vts: false,
            no_login: false,
            splash_only: false,
            dev_mode: false,
            print_resolution: false,
            port: DEFAULT_PORT,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            loop_start: -1,
            loop_count: -1,
            loop_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            loop_offset: (0, 0),
            offset: (0, 0),
            scale: 0,
            clear_color: 0,
            images: Vec::new(),
            images_hires: Vec::new(),
            splash_frames: Vec::new(),
        }
    }
}

impl Config {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Config> {
        let mut config = Config::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag.to_owned(), Some(value.to_owned())),
                None => (arg, None),
            };

            let value = |args: &mut I::IntoIter| -> Result<String> {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| CinderError::BadArgument(format!("{flag} needs a value")))
            };

            match flag.as_str() {
                "--daemon" => config.daemon = true,
                "--enable-vts" => config.enable_vts = true,
                "--enable-vt1" => config.enable_vt1 = true,
                "--enable-gfx" => config.enable_gfx = true,
                "--pre-create-vts" => config.pre_create_vts = true,
                "--no-login" => config.no_login = true,
                "--splash-only" => config.splash_only = true,
                "--dev-mode" => config.dev_mode = true,
                "--print-resolution" => config.print_resolution = true,
                "--num-vts" => {
                    let n = parse_u32(&value(&mut args)?)? as usize;
                    if n == 0 {
                        return Err(CinderError::BadArgument("--num-vts=0".into()));
                    }
                    if n > MAX_VTS {
                        tracing::warn!("--num-vts={n} clamped to {MAX_VTS}");
                    }
                    config.num_vts = n.min(MAX_VTS);
                }
                "--port" => {
                    config.port = parse_u32(&value(&mut args)?)? as u16;
                }
                "--frame-interval" => {
                    config.frame_interval_ms = parse_u32(&value(&mut args)?)? as u64;
                }
                "--loop-start" => {
                    config.loop_start = parse_i32(&value(&mut args)?)?;
                }
                "--loop-count" => {
                    config.loop_count = parse_i32(&value(&mut args)?)?;
                }
                "--loop-interval" => {
                    config.loop_interval_ms = parse_u32(&value(&mut args)?)? as u64;
                }
                "--loop-offset" => {
                    config.loop_offset = parse_pair(&value(&mut args)?)?;
                }
                "--offset" => {
                    config.offset = parse_pair(&value(&mut args)?)?;
                }
                "--scale" => {
                    let s = parse_u32(&value(&mut args)?)?;
                    if !(1..=4).contains(&s) {
                        return Err(CinderError::BadArgument(format!("--scale={s}")));
                    }
                    config.scale = s;
                }
                "--clear" => {
                    config.clear_color = parse_color(&value(&mut args)?)?;
                }
                "--image" => {
                    let image = value(&mut args)?;
                    config.images.push(image);
                }
                "--image-hires" => {
                    let image = value(&mut args)?;
                    config.images_hires.push(image);
                }
                other if other.starts_with("--") => {
                    return Err(CinderError::BadArgument(other.to_owned()));
                }
                _ => config.splash_frames.push(flag),
            }
        }

        Ok(config)
    }
}

pub fn parse_u32(s: &str) -> Result<u32> {
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|_| CinderError::BadArgument(s.to_owned()))
}

pub fn parse_i32(s: &str) -> Result<i32> {
    s.parse()
        .map_err(|_| CinderError::BadArgument(s.to_owned()))
}

/// Parse an `X,Y` integer pair, as used by the offset and location options.
pub fn parse_pair(s: &str) -> Result<(i32, i32)> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| CinderError::BadArgument(s.to_owned()))?;
    Ok((parse_i32(x.trim())?, parse_i32(y.trim())?))
}

pub fn format_pair(pair: (i32, i32)) -> String {
    format!("{},{}", pair.0, pair.1)
}

pub fn parse_color(s: &str) -> Result<u32> {
    parse_u32(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        Config::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.num_vts, 4);
        assert_eq!(config.port, 6530);
        assert_eq!(config.frame_interval_ms, 25);
        assert_eq!(config.loop_start, -1);
        assert!(!config.enable_vts);
    }

    #[test]
    fn flags_and_positionals() {
        let config = parse(&[
            "--daemon",
            "--enable-vts",
            "--frame-interval=40",
            "--clear=0x336699",
            "a.png",
            "b.png",
        ])
        .unwrap();
        assert!(config.daemon);
        assert!(config.enable_vts);
        assert_eq!(config.frame_interval_ms, 40);
        assert_eq!(config.clear_color, 0x336699);
        assert_eq!(config.splash_frames, vec!["a.png", "b.png"]);
    }

    #[test]
    fn separate_value_form() {
        let config = parse(&["--num-vts", "6", "--offset", "12,-7"]).unwrap();
        assert_eq!(config.num_vts, 6);
        assert_eq!(config.offset, (12, -7));
    }

    #[test]
    fn num_vts_bounds() {
        assert_eq!(parse(&["--num-vts=30"]).unwrap().num_vts, MAX_VTS);
        assert!(parse(&["--num-vts=0"]).is_err());
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(parse(&["--what-is-this"]).is_err());
    }

    #[test]
    fn pair_round_trip() {
        for pair in [(0, 0), (100, 200), (-15, 7), (i32::MAX, i32::MIN)] {
            assert_eq!(parse_pair(&format_pair(pair)).unwrap(), pair);
        }
    }

    #[test]
    fn scale_range() {
        assert_eq!(parse(&["--scale=2"]).unwrap().scale, 2);
        assert!(parse(&["--scale=5"]).is_err());
    }
}
