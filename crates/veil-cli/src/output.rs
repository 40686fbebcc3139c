//! Rendering of daemon responses for the terminal.

use std::process::ExitCode;

use veil_runtime::protocol::Response;

/// Describes a response code in words.
#[must_use]
pub const fn describe(response: Response) -> &'static str {
    match response {
        Response::Ok => "done",
        Response::Enforced => "denylist is enforced",
        Response::NotEnforced => "denylist is not enforced",
        Response::ItemExist => "target already exists in the denylist",
        Response::ItemNotExist => "target does not exist in the denylist",
        Response::InvalidPkg => "invalid or uninstalled package name",
        Response::NoNs => "kernel does not support mount namespaces",
        Response::Error => "daemon reported an error",
    }
}

/// Maps a response to the process exit status.
#[must_use]
pub const fn exit_status(response: Response) -> u8 {
    match response {
        Response::Ok | Response::Enforced => 0,
        _ => 1,
    }
}

/// Prints a response to stderr unless it is a plain success, then returns
/// the matching exit status.
pub fn report(response: Response) -> ExitCode {
    if response != Response::Ok {
        eprintln!("{}", describe(response));
    }
    ExitCode::from(exit_status(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_codes_exit_zero() {
        assert_eq!(exit_status(Response::Ok), 0);
        assert_eq!(exit_status(Response::Enforced), 0);
    }

    #[test]
    fn failure_codes_exit_one() {
        for response in [
            Response::NotEnforced,
            Response::ItemExist,
            Response::ItemNotExist,
            Response::InvalidPkg,
            Response::NoNs,
            Response::Error,
        ] {
            assert_eq!(exit_status(response), 1);
        }
    }

    #[test]
    fn every_code_has_a_description() {
        assert_eq!(describe(Response::NoNs), "kernel does not support mount namespaces");
        assert!(!describe(Response::Error).is_empty());
    }
}
