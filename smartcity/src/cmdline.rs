use clap::{Arg, ArgAction, Command};

pub(super) const VALIDATE_CONFIG: &str = "validate-config";

pub(super) fn root_cli() -> Command {
    Command::new("smartcity-ingest")
        .author("SmartCity Authors")
        .about("Ingests the smart-city telemetry streams from Kafka into Parquet")
        .long_about(
            "Ingests the vehicle, gps, traffic, weather and emergency streams from Kafka into \
             Parquet on an object store. Configuration is read from SMARTCITY_* and AWS_* \
             environment variables.",
        )
        .arg(
            Arg::new(VALIDATE_CONFIG)
                .long(VALIDATE_CONFIG)
                .help("Load and validate the configuration, then exit")
                .action(ArgAction::SetTrue),
        )
}
