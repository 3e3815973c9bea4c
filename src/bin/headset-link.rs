use std::env;
use headset_link::run;
use headset_link::error::{AppRunError, ConfigError};

fn main() -> Result<(), AppRunError> {
    match run(env::args_os()) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            eprintln!("headset-link is already running");
            Ok(())
        },
        Err(err) => {
            eprintln!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
