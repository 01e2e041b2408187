//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

use crate::settings::{AppSettings, SERVER_URL_ENV};

/// MonkeyRead - read a passage aloud and watch it get marked word by word
#[derive(Parser, Debug, Default)]
#[command(name = "monkeyread")]
#[command(version)]
#[command(about = "Streams microphone audio to a reading server and shows live word marks")]
pub struct Args {
    /// Reading server WebSocket URL
    #[arg(short = 'u', long, value_name = "URL", env = SERVER_URL_ENV)]
    pub url: Option<String>,

    /// Samples per audio frame sent to the server
    #[arg(short = 'f', long, value_name = "SAMPLES")]
    pub frame_size: Option<usize>,

    /// Settings file (defaults to the user config directory)
    #[arg(short = 's', long, value_name = "PATH")]
    pub settings: Option<PathBuf>,

    /// Write the effective settings back to the settings file
    #[arg(long)]
    pub save: bool,
}

impl Args {
    /// Layer command-line values over loaded settings
    pub fn apply(&self, settings: &mut AppSettings) {
        if let Some(url) = &self.url {
            settings.server_url = url.clone();
        }
        if let Some(frame_size) = self.frame_size {
            settings.frame_size = frame_size;
        }
    }
}
