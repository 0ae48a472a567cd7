//! Prints the products closest to a user in exported embedding space.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use jrl::embeddings::EmbeddingTable;

#[derive(Parser)]
#[command(about = "Show the nearest products to a user", long_about = None)]
struct Options {
    /// User embeddings written by `jrl --decode --test-mode output_embedding`.
    #[arg(long, value_name = "FILE")]
    users: PathBuf,

    /// Product embeddings from the same export.
    #[arg(long, value_name = "FILE")]
    products: PathBuf,

    /// Number of products to show.
    #[arg(short, default_value_t = 40)]
    n: usize,

    /// Compare by cosine similarity instead of dot product.
    #[arg(long)]
    cosine: bool,

    /// Users to look up. Reads one per line from stdin if none are given.
    user_ids: Vec<String>,
}

fn show(users: &EmbeddingTable, products: &EmbeddingTable, options: &Options, id: &str) {
    let Some(u) = users.lookup(id) else {
        println!("{id}: unknown user");
        return;
    };
    println!();
    println!("{:>50}\t\tScore", "Product");
    println!("------------------------------------------------------------------------");
    for (p, score) in products.nearest(&users[u], options.n, options.cosine) {
        println!("{:>50}\t\t{score}", products.id(p));
    }
}

fn run(options: Options) -> Result<()> {
    let users = EmbeddingTable::load(&options.users).context("error loading user embeddings")?;
    let products =
        EmbeddingTable::load(&options.products).context("error loading product embeddings")?;
    anyhow::ensure!(
        users.size() == products.size(),
        "user vectors have {} dimensions but product vectors have {}",
        users.size(),
        products.size()
    );

    if !options.user_ids.is_empty() {
        for id in &options.user_ids {
            show(&users, &products, &options, id);
        }
        return Ok(());
    }

    let stdin = io::stdin();
    loop {
        print!("Enter user id (EXIT to break): ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let id = line.trim();
        if id == "EXIT" {
            break;
        }
        show(&users, &products, &options, id);
    }
    Ok(())
}

fn main() {
    let options = Options::parse();

    if let Err(err) = run(options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
