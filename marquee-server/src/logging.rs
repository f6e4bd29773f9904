use colored::{Color, ColoredString, Colorize};
use log::{Level, LevelFilter};

/// The workspace's crates and the badge color each one logs under.
/// Targets outside this table are external and only surface at warn
/// and above.
const LOCAL_CRATES: [(&str, Color); 3] = [
    ("marquee_core", Color::Blue),
    ("marquee_cluster", Color::BrightMagenta),
    ("marquee_server", Color::BrightGreen),
];

pub fn init_logger() {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} {} {}",
                level_badge(record.level()),
                chrono::Local::now()
                    .format("%H:%M:%S")
                    .to_string()
                    .bright_black(),
                target_badge(record.target()),
                message
            ))
        })
        .level(LevelFilter::Warn);

    for (name, _) in LOCAL_CRATES {
        dispatch = dispatch.level_for(name, LevelFilter::Info);
    }

    dispatch
        .chain(std::io::stdout())
        .apply()
        .expect("logging is initialized")
}

fn target_badge(target: &str) -> ColoredString {
    let name = target.split("::").next().unwrap_or(target);

    match LOCAL_CRATES.iter().find(|(local, _)| *local == name) {
        Some((_, color)) => {
            // "marquee_cluster" badges as "CLUSTER"
            let short = name.strip_prefix("marquee_").unwrap_or(name);

            format!("{:^7}", short.to_uppercase()).color(*color)
        }
        None => format!("{:^7}", name).normal(),
    }
}

fn level_badge(level: Level) -> ColoredString {
    match level {
        Level::Error => " ERR ".black().on_red().bold(),
        Level::Warn => " WRN ".black().on_yellow().bold(),
        Level::Info => " INF ".black().on_blue().bold(),
        Level::Debug => " DBG ".white().on_black(),
        Level::Trace => " TRC ".normal(),
    }
}
