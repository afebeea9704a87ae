//! The external command channel. One verb set, two interchangeable
//! transports picked at startup: a TCP socket or the system bus.

pub mod bus;
pub mod socket;

use crate::config::parse_pair;
use crate::image::Placement;

pub const COMMAND_MAKE_VT: &str = "MakeVT";
pub const COMMAND_SWITCH_VT: &str = "SwitchVT";
pub const COMMAND_TERMINATE: &str = "Terminate";
pub const COMMAND_IMAGE: &str = "Image";

#[derive(Clone, Debug, PartialEq)]
pub enum CommandRequest {
    MakeVt(usize),
    SwitchVt(usize),
    Terminate,
    Image { path: String, placement: Placement },
}

/// Parse one `Command [opt:val] ...` line, the wire form shared by both
/// transports.
pub fn parse_command(line: &str) -> Result<CommandRequest, String> {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or("empty command")?;

    match verb {
        COMMAND_MAKE_VT | COMMAND_SWITCH_VT => {
            let vt = tokens
                .next()
                .and_then(|t| t.parse::<usize>().ok())
                .ok_or_else(|| format!("{verb}: missing VT number"))?;
            if verb == COMMAND_MAKE_VT {
                Ok(CommandRequest::MakeVt(vt))
            } else {
                Ok(CommandRequest::SwitchVt(vt))
            }
        }
        COMMAND_TERMINATE => Ok(CommandRequest::Terminate),
        COMMAND_IMAGE => parse_image_options(tokens),
        other => Err(format!("unknown command {other}")),
    }
}

/// The `Image` options. `location` beats `offset` when both are present;
/// the default is centered.
pub fn parse_image_options<'a, I>(tokens: I) -> Result<CommandRequest, String>
where
    I: Iterator<Item = &'a str>,
{
    let mut path = None;
    let mut location = None;
    let mut offset = None;

    for token in tokens {
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        match key {
            "image" => path = Some(value.to_owned()),
            "location" => location = parse_pair(value).ok(),
            "offset" => offset = parse_pair(value).ok(),
            _ => {}
        }
    }

    let path = path.ok_or("Image: missing image:PATH")?;
    let placement = match (location, offset) {
        (Some((x, y)), _) => Placement::Location(x, y),
        (None, Some((x, y))) => Placement::Offset(x, y),
        (None, None) => Placement::Center,
    };
    Ok(CommandRequest::Image { path, placement })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_parse() {
        assert_eq!(parse_command("MakeVT 2"), Ok(CommandRequest::MakeVt(2)));
        assert_eq!(parse_command("SwitchVT 0"), Ok(CommandRequest::SwitchVt(0)));
        assert_eq!(parse_command("Terminate"), Ok(CommandRequest::Terminate));
        assert_eq!(parse_command("Terminate\n"), Ok(CommandRequest::Terminate));
    }

    #[test]
    fn bad_requests_are_rejected() {
        assert!(parse_command("").is_err());
        assert!(parse_command("MakeVT").is_err());
        assert!(parse_command("MakeVT two").is_err());
        assert!(parse_command("Reboot").is_err());
        assert!(parse_command("Image location:1,2").is_err());
    }

    #[test]
    fn image_placements() {
        assert_eq!(
            parse_command("Image image:/tmp/logo.png location:100,200"),
            Ok(CommandRequest::Image {
                path: "/tmp/logo.png".into(),
                placement: Placement::Location(100, 200),
            })
        );
        assert_eq!(
            parse_command("Image image:/tmp/logo.png offset:0,0"),
            Ok(CommandRequest::Image {
                path: "/tmp/logo.png".into(),
                placement: Placement::Offset(0, 0),
            })
        );
        assert_eq!(
            parse_command("Image image:/tmp/logo.png"),
            Ok(CommandRequest::Image {
                path: "/tmp/logo.png".into(),
                placement: Placement::Center,
            })
        );
        // location wins over offset regardless of order.
        assert_eq!(
            parse_command("Image offset:5,5 image:/a.png location:1,2"),
            Ok(CommandRequest::Image {
                path: "/a.png".into(),
                placement: Placement::Location(1, 2),
            })
        );
    }
}
