//! pktlink one-shot client
//!
//! Connects, sends one REQUEST, prints the reply and exits.
//!
//! Usage:
//!     pktlink-call <address> <command> [format value...] [-r reply_format]
//!
//! Format tags: `i` int, `d` float, `s` string (one value per tag).
//!
//! Examples:
//!     pktlink-call @pktlink.echo ping -r i
//!     pktlink-call /tmp/app.sock add ii 40 2 -r i

use pktlink::{oneshot_send, Packet, UnixTransport, Value};

fn usage() -> ! {
    eprintln!("usage: pktlink-call <address> <command> [format value...] [-r reply_format]");
    std::process::exit(2);
}

fn parse_value(tag: char, raw: &str) -> Result<Value, String> {
    match tag {
        'i' | 'I' => raw
            .parse::<i32>()
            .map(Value::Int)
            .map_err(|e| format!("{:?}: {}", raw, e)),
        'd' | 'D' => raw
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|e| format!("{:?}: {}", raw, e)),
        's' | 'S' => Ok(Value::Str(raw.to_string())),
        other => Err(format!("unknown format tag '{}'", other)),
    }
}

fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut reply_format = None;
    if let Some(pos) = args.iter().position(|a| a == "-r") {
        if pos + 1 >= args.len() {
            usage();
        }
        reply_format = Some(args.remove(pos + 1));
        args.remove(pos);
    }
    if args.len() < 2 {
        usage();
    }

    let address = &args[0];
    let command = &args[1];
    let format = args.get(2).map(String::as_str).unwrap_or("");
    let raw_values = args.get(3..).unwrap_or(&[]);
    if format.chars().count() != raw_values.len() {
        eprintln!(
            "pktlink-call: format {:?} needs {} value(s), got {}",
            format,
            format.chars().count(),
            raw_values.len()
        );
        std::process::exit(2);
    }

    let values: Vec<Value> = match format
        .chars()
        .zip(raw_values)
        .map(|(tag, raw)| parse_value(tag, raw))
        .collect()
    {
        Ok(values) => values,
        Err(e) => {
            eprintln!("pktlink-call: {}", e);
            std::process::exit(2);
        }
    };

    let request = match Packet::create(command, format, &values) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("pktlink-call: {}", e);
            std::process::exit(2);
        }
    };

    let reply = match oneshot_send(&UnixTransport::new(), address, &request) {
        Ok(reply) => reply,
        Err(e) => {
            eprintln!("pktlink-call: {}: {}", address, e);
            std::process::exit(1);
        }
    };
    println!("{}", reply);

    if let Some(fmt) = reply_format {
        match reply.get(&fmt) {
            Ok(fields) => {
                for field in fields {
                    match field {
                        Value::Int(v) => println!("  i {}", v),
                        Value::Float(v) => println!("  d {}", v),
                        Value::Str(v) => println!("  s {:?}", v),
                    }
                }
            }
            Err(e) => {
                eprintln!("pktlink-call: decode reply as {:?}: {}", fmt, e);
                std::process::exit(1);
            }
        }
    }
}
