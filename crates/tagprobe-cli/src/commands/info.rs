use tagprobe_core::detect_machine_info;

pub fn run() {
    let info = detect_machine_info();
    println!("tagprobe {}", tagprobe_core::VERSION);
    println!("  os:        {}", info.os);
    println!("  arch:      {}", info.arch);
    println!("  cpu:       {}", info.cpu);
    println!("  cores:     {}", info.cores);
    println!("  page size: {}", info.page_size);
    println!(
        "  mte:       {}",
        if info.mte { "available" } else { "not available" }
    );
}
