// 构建脚本: 静态链接的 FFmpeg 在 Windows MSVC 下需要的系统库
//
// build.rs 运行在宿主机上, 目标平台要看 CARGO_CFG_* 环境变量
fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let env = std::env::var("CARGO_CFG_TARGET_ENV").unwrap_or_default();
    if os != "windows" || env != "msvc" {
        return;
    }

    // vcpkg 版 FFmpeg 依赖: Intel QSV / x264
    for lib in ["libmfx", "libx264"] {
        println!("cargo:rustc-link-lib=dylib={}", lib);
    }

    // DirectShow 摄像头采集 (dshow) 与 COM
    for lib in ["strmiids", "ole32", "oleaut32", "vfw32", "user32"] {
        println!("cargo:rustc-link-lib=dylib={}", lib);
    }

    // Secure Channel (TLS/SSL)
    println!("cargo:rustc-link-lib=dylib=secur32");
}
